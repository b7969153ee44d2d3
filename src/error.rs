//! Error types and HTTP error response handling.
//!
//! Engine layers have their own error enums (`StoreError`, `PanelError`,
//! `GateError`, `PaymentError`). Handlers convert them into [`AppError`],
//! which decides the status code and JSON body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{payments::PaymentError, services::payment_gate::GateError, store::StoreError};

/// HTTP-facing error type.
///
/// # Error Categories
///
/// - **Internal**: store failures (including the database), hidden from the client
/// - **Lookup**: unknown subscription token
/// - **Provider**: callbacks that fail verification or hit a disabled provider,
///   and provider APIs that cannot confirm a payment
/// - **Conflict**: a payment for the same user is already being applied
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// No user holds the requested subscription token.
    ///
    /// Returns HTTP 404 Not Found. An existing but empty subscription is a
    /// 200 with an empty feed instead.
    #[error("Subscription not found")]
    SubscriptionNotFound,

    /// Returns HTTP 401 Unauthorized.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The provider's secret is missing from settings.
    ///
    /// Returns HTTP 403 Forbidden. Only this provider's endpoint is affected.
    #[error("{0} is not configured")]
    ProviderNotConfigured(&'static str),

    /// Returns HTTP 403 Forbidden.
    #[error("Forbidden")]
    Forbidden,

    /// The provider's API could not confirm a payment.
    ///
    /// Returns HTTP 502 Bad Gateway so the provider retries the callback.
    #[error("{0} API unavailable")]
    ProviderUnavailable(&'static str),

    /// Returns HTTP 400 Bad Request.
    #[error("Invalid request")]
    InvalidRequest(String),

    /// Another completion holds the user. Returns HTTP 409 Conflict so the
    /// provider retries later.
    #[error("Payment already in progress")]
    PaymentInProgress,
}

/// Verification failures keep their meaning: a disabled provider stays 403,
/// a bad signature 401, a malformed body 400. An unreachable provider API is
/// logged here, since the response hides the reason.
impl From<PaymentError> for AppError {
    fn from(error: PaymentError) -> Self {
        match error {
            PaymentError::NotConfigured(provider) => AppError::ProviderNotConfigured(provider),
            PaymentError::Forbidden => AppError::Forbidden,
            PaymentError::InvalidSignature => AppError::InvalidSignature,
            PaymentError::MissingSignature => {
                AppError::InvalidRequest("missing signature".to_string())
            }
            PaymentError::Malformed(reason) => AppError::InvalidRequest(reason),
            PaymentError::Unavailable(provider, reason) => {
                tracing::error!(provider, reason = %reason, "Payment confirmation failed");
                AppError::ProviderUnavailable(provider)
            }
        }
    }
}

/// Store failures inside the gate surface as 500; an invalid payment or an
/// unknown user is the provider's request at fault and answers 400.
impl From<GateError> for AppError {
    fn from(error: GateError) -> Self {
        match error {
            GateError::Store(e) => AppError::Store(e),
            GateError::Invalid(reason) => AppError::InvalidRequest(reason),
            GateError::UnknownUser(user_id) => {
                AppError::InvalidRequest(format!("user {user_id} not found"))
            }
        }
    }
}

/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::SubscriptionNotFound => (
                StatusCode::NOT_FOUND,
                "subscription_not_found",
                self.to_string(),
            ),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                self.to_string(),
            ),
            AppError::ProviderNotConfigured(_) => (
                StatusCode::FORBIDDEN,
                "provider_not_configured",
                self.to_string(),
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string()),
            AppError::ProviderUnavailable(_) => (
                StatusCode::BAD_GATEWAY,
                "provider_unavailable",
                self.to_string(),
            ),
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::PaymentInProgress => (
                StatusCode::CONFLICT,
                "payment_in_progress",
                self.to_string(),
            ),
            AppError::Store(ref e) => {
                tracing::error!(error = %e, "Store error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
