//! HTTP request handlers and the router that mounts them.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Service health
pub mod health;
/// Provider callbacks
pub mod payments;
/// Subscription feed
pub mod subscription;

/// Build the application router.
///
/// # Routes
///
/// - `GET /health`
/// - `GET /sub/{token}`
/// - `POST /webhooks/cryptobot` (always refused, the secret route is required)
/// - `POST /webhooks/cryptobot/{secret}`
/// - `POST /webhooks/heleket`
/// - `POST /webhooks/yookassa`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/sub/{token}", get(subscription::subscription_feed))
        .route("/webhooks/cryptobot", post(payments::cryptobot_webhook))
        .route(
            "/webhooks/cryptobot/{secret}",
            post(payments::cryptobot_webhook_with_secret),
        )
        .route("/webhooks/heleket", post(payments::heleket_webhook))
        .route("/webhooks/yookassa", post(payments::yookassa_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
