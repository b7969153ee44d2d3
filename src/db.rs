//! Postgres pool and schema migrations for the entitlement store.

use std::time::Duration;

use sqlx::{Pool, Postgres};

pub type DbPool = Pool<Postgres>;

/// Open the connection pool shared by the background loop and the handlers.
///
/// # Arguments
///
/// * `database_url` - PostgreSQL connection string (`DATABASE_URL`)
///
/// # Configuration
///
/// - Maximum connections: 10
/// - Acquire timeout: 5 seconds
/// - Store operations hold a connection for one statement or transaction
///
/// # Errors
///
/// Returns an error if:
/// - The connection string is invalid
/// - The database cannot be reached within the acquire timeout
/// - Authentication fails
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Apply the SQL files under `migrations/`.
///
/// Applied versions are tracked in `_sqlx_migrations`, so restarts are no-ops
/// once the schema is current.
///
/// # Arguments
///
/// * `pool` - Database connection pool
///
/// # Errors
///
/// Returns an error if:
/// - A migration file fails to execute
/// - An applied migration was edited after it ran (checksum mismatch)
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
