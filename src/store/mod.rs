//! The entitlement store.
//!
//! Every component reads and writes users, keys, tombstones and the
//! idempotency ledgers through [`EntitlementStore`]. Each method is one short
//! statement or one small transaction; no method holds a lock across calls.
//!
//! [`PgStore`] is the production implementation. [`InMemoryStore`] has the
//! same semantics and backs the tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    host::Host,
    key::{Key, NewKey},
    notification::NotificationKind,
    plan::Plan,
    transaction::{NewTransaction, Transaction},
    user::User,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Errors raised by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness or reference constraint rejected the write.
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// The referenced record does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The operation was switched off on the in-memory store.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The in-memory store's lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for every record the engine touches.
///
/// # Errors
///
/// Every method returns [`StoreError::Database`] when Postgres fails.
/// [`InMemoryStore`] returns [`StoreError::Unavailable`] for operations a
/// test switched off, and [`StoreError::Poisoned`] after a panicking writer.
/// Errors specific to one method are listed on it.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Check the backing database answers.
    async fn ping(&self) -> StoreResult<()>;

    // Users

    /// Create a user with a fresh subscription token, or return the existing
    /// one untouched. Tokens are never rotated.
    async fn register_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        referred_by: Option<i64>,
    ) -> StoreResult<User>;

    async fn user(&self, user_id: i64) -> StoreResult<Option<User>>;

    async fn user_by_token(&self, token: &str) -> StoreResult<Option<User>>;

    /// Flip `pending_payment` from false to true in one conditional update.
    ///
    /// Returns `false` when the flag was already set (or the user does not
    /// exist), meaning another completion owns the user.
    ///
    /// # Arguments
    ///
    /// * `user_id` - the paying user
    async fn try_begin_payment(&self, user_id: i64) -> StoreResult<bool>;

    /// Clear `pending_payment` unconditionally.
    async fn finish_payment(&self, user_id: i64) -> StoreResult<()>;

    /// Clear every leftover `pending_payment` flag. Returns how many were set.
    async fn clear_all_pending_payments(&self) -> StoreResult<u64>;

    /// Add a purchase to the user's lifetime stats.
    async fn record_purchase(&self, user_id: i64, amount_cents: i64, months: i32)
    -> StoreResult<()>;

    async fn add_referral_balance(&self, user_id: i64, amount_cents: i64) -> StoreResult<()>;

    // Hosts and plans

    async fn hosts(&self, only_enabled: bool) -> StoreResult<Vec<Host>>;

    async fn host(&self, host_name: &str) -> StoreResult<Option<Host>>;

    async fn upsert_host(&self, host: &Host) -> StoreResult<()>;

    async fn set_host_enabled(&self, host_name: &str, enabled: bool) -> StoreResult<()>;

    async fn plan(&self, plan_id: i64) -> StoreResult<Option<Plan>>;

    /// Ids of every plan bound to the global pseudo-host.
    async fn global_plan_ids(&self) -> StoreResult<BTreeSet<i64>>;

    async fn create_plan(
        &self,
        host_name: &str,
        plan_name: &str,
        months: i32,
        price_cents: i64,
    ) -> StoreResult<Plan>;

    // Keys and tombstones

    async fn keys_for_host(&self, host_name: &str) -> StoreResult<Vec<Key>>;

    async fn keys_for_user(&self, user_id: i64) -> StoreResult<Vec<Key>>;

    async fn all_keys(&self) -> StoreResult<Vec<Key>>;

    async fn key(&self, key_id: i64) -> StoreResult<Option<Key>>;

    /// Insert a key, or update the one holding the same alias.
    ///
    /// On update the expiry never moves backwards, a missing descriptor keeps
    /// the cached one, and any tombstone on the alias is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] when the owning user does not exist.
    async fn upsert_key(&self, key: &NewKey) -> StoreResult<Key>;

    /// Overwrite a key's remote-owned fields with what the panel reports and
    /// clear its tombstone.
    async fn sync_key_from_remote(
        &self,
        alias: &str,
        client_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn set_key_descriptor(&self, key_id: i64, descriptor: &str) -> StoreResult<()>;

    /// Delete a key together with its tombstone. Returns whether a key existed.
    async fn delete_key(&self, alias: &str) -> StoreResult<bool>;

    /// Tombstone a key. An existing tombstone keeps its first-seen timestamp.
    ///
    /// Returns `true` when a new tombstone was written.
    async fn mark_key_missing(
        &self,
        alias: &str,
        host_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Remove a tombstone. Returns whether one existed.
    async fn clear_missing_marker(&self, alias: &str) -> StoreResult<bool>;

    // Notification ledger

    /// Thresholds already delivered for an entity.
    async fn sent_thresholds(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
    ) -> StoreResult<Vec<i32>>;

    /// Append a ledger row. Returns `false` if the row already existed.
    async fn record_notification(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
        threshold_hours: i32,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Drop an entity's ledger rows after it was renewed, so its thresholds
    /// fire again for the new expiry.
    async fn forget_notifications(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
    ) -> StoreResult<u64>;

    /// Drop ledger rows sent before `older_than`. Returns how many went.
    async fn prune_notifications(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    // Webhook ledger and payment log

    async fn is_webhook_processed(&self, provider: &str, external_id: &str) -> StoreResult<bool>;

    /// Record a callback id. Returns `false` if it was already recorded.
    ///
    /// # Arguments
    ///
    /// * `provider` - adapter name, scoping the id
    /// * `external_id` - native payment id or payload digest
    async fn mark_webhook_processed(
        &self,
        provider: &str,
        external_id: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Forget a callback id so the provider's retry is processed again.
    async fn release_webhook(&self, provider: &str, external_id: &str) -> StoreResult<()>;

    async fn log_transaction(&self, transaction: &NewTransaction) -> StoreResult<Transaction>;

    async fn transactions_for_user(&self, user_id: i64) -> StoreResult<Vec<Transaction>>;

    // Settings

    async fn setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}
