//! Liveness endpoint for monitoring.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,

    /// `connected` once the entitlement store answered
    pub store: &'static str,

    /// Panels the reconciler and the feed currently serve
    pub enabled_hosts: usize,

    pub timestamp: DateTime<Utc>,
}

/// `GET /health`
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "store": "connected",
///   "enabled_hosts": 3,
///   "timestamp": "2026-03-01T12:00:00Z"
/// }
/// ```
///
/// A store that does not answer yields the standard 500 error body.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    state.store.ping().await?;
    let enabled_hosts = state.store.hosts(true).await?.len();

    Ok(Json(HealthResponse {
        status: "healthy",
        store: "connected",
        enabled_hosts,
        timestamp: Utc::now(),
    }))
}
