//! Payment provider callback endpoints.
//!
//! Each handler verifies the callback the provider's way and hands the
//! normalised payment to the gate. The gate runs on its own task: if it has
//! not finished within [`ACK_TIMEOUT`] the provider gets its 200 anyway and
//! the work carries on, with the webhook ledger absorbing any retry.

use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::Serialize;

use crate::{
    config::settings,
    error::AppError,
    payments::{
        PaymentError, Verdict, cryptobot, heleket, secrets_match,
        yookassa::{self, ShopCredentials},
    },
    services::payment_gate::GateOutcome,
    state::AppState,
};

/// How long a callback waits for the gate before acknowledging.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of every accepted callback.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    /// `ok`, `duplicate`, `ignored`, `failed` or `accepted`
    pub status: &'static str,
}

fn ack(status: &'static str) -> Json<AckResponse> {
    Json(AckResponse { status })
}

/// `POST /webhooks/cryptobot`
///
/// Always refused: CryptoBot callbacks must carry the webhook secret in the
/// path.
pub async fn cryptobot_webhook(State(state): State<AppState>) -> Result<Json<AckResponse>, AppError> {
    match state.store.setting(settings::CRYPTOBOT_WEBHOOK_SECRET).await? {
        Some(secret) if !secret.is_empty() => {
            tracing::warn!("CryptoBot callback without path secret refused");
            Err(AppError::Forbidden)
        }
        _ => Err(PaymentError::NotConfigured(cryptobot::PROVIDER).into()),
    }
}

/// `POST /webhooks/cryptobot/{secret}`
///
/// # Errors
///
/// - 403 `provider_not_configured`: no webhook secret in settings
/// - 403 `forbidden`: the path secret does not match
/// - 401 `invalid_signature`: an API token is configured and the
///   `crypto-pay-api-signature` header is missing or wrong
/// - 400 `invalid_request`: malformed update or metadata
/// - 409 `payment_in_progress`: another payment for the user is being applied
pub async fn cryptobot_webhook_with_secret(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AckResponse>, AppError> {
    let configured = state
        .store
        .setting(settings::CRYPTOBOT_WEBHOOK_SECRET)
        .await?
        .filter(|s| !s.is_empty())
        .ok_or(PaymentError::NotConfigured(cryptobot::PROVIDER))?;

    if !secrets_match(&configured, &secret) {
        tracing::warn!("CryptoBot callback with wrong path secret refused");
        return Err(PaymentError::Forbidden.into());
    }

    if let Some(token) = state
        .store
        .setting(settings::CRYPTOBOT_TOKEN)
        .await?
        .filter(|t| !t.is_empty())
    {
        let signature = headers
            .get(cryptobot::SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;
        if !cryptobot::verify_signature(&token, &body, signature) {
            tracing::warn!("CryptoBot callback with invalid signature refused");
            return Err(PaymentError::InvalidSignature.into());
        }
    }

    dispatch(&state, cryptobot::parse_update(&body)?).await
}

/// `POST /webhooks/heleket`
///
/// # Errors
///
/// - 403 `provider_not_configured`: no API key in settings
/// - 400 `invalid_request`: missing `sign` or malformed metadata
/// - 401 `invalid_signature`: `sign` does not match
/// - 409 `payment_in_progress`: another payment for the user is being applied
pub async fn heleket_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AckResponse>, AppError> {
    let api_key = state
        .store
        .setting(settings::HELEKET_API_KEY)
        .await?
        .filter(|k| !k.is_empty())
        .ok_or(PaymentError::NotConfigured(heleket::PROVIDER))?;

    let verdict = heleket::verify_and_parse(&body, &api_key).inspect_err(|e| {
        if matches!(e, PaymentError::InvalidSignature) {
            tracing::warn!("Heleket callback with invalid signature refused");
        }
    })?;

    dispatch(&state, verdict).await
}

/// `POST /webhooks/yookassa`
///
/// YooKassa notifications are unsigned. A `payment.succeeded` event is only
/// dispatched once the YooKassa API reports the payment as `succeeded`.
///
/// # Errors
///
/// - 403 `provider_not_configured`: shop id or secret key missing from settings
/// - 400 `invalid_request`: malformed notification or metadata
/// - 502 `provider_unavailable`: the payment status could not be read
/// - 409 `payment_in_progress`: another payment for the user is being applied
pub async fn yookassa_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AckResponse>, AppError> {
    let shop_id = state.store.setting(settings::YOOKASSA_SHOP_ID).await?;
    let secret_key = state.store.setting(settings::YOOKASSA_SECRET_KEY).await?;
    let shop = match (shop_id, secret_key) {
        (Some(shop_id), Some(secret_key)) if !shop_id.is_empty() && !secret_key.is_empty() => {
            ShopCredentials {
                shop_id,
                secret_key,
            }
        }
        _ => {
            tracing::error!("YooKassa notification refused, shop credentials not configured");
            return Err(PaymentError::NotConfigured(yookassa::PROVIDER).into());
        }
    };

    let verdict = yookassa::verify(state.yookassa.as_ref(), &shop, &body).await?;

    dispatch(&state, verdict).await
}

async fn dispatch(state: &AppState, verdict: Verdict) -> Result<Json<AckResponse>, AppError> {
    let callback = match verdict {
        Verdict::Ignored(reason) => {
            tracing::info!(reason = %reason, "Payment callback ignored");
            return Ok(ack("ignored"));
        }
        Verdict::Payment(callback) => callback,
    };

    let provider = callback.provider;
    let external_id = callback.external_id.as_str().to_string();
    let gate = state.gate.clone();
    let task = tokio::spawn(async move { gate.process(callback, Utc::now()).await });

    match tokio::time::timeout(ACK_TIMEOUT, task).await {
        Ok(Ok(Ok(outcome))) => match outcome {
            GateOutcome::Completed(_) => Ok(ack("ok")),
            GateOutcome::Duplicate => Ok(ack("duplicate")),
            GateOutcome::Failed(_) => Ok(ack("failed")),
            GateOutcome::Busy => Err(AppError::PaymentInProgress),
        },
        Ok(Ok(Err(e))) => Err(e.into()),
        Ok(Err(join_error)) => {
            tracing::error!(provider, external_id = %external_id, error = %join_error, "Payment task aborted");
            Ok(ack("accepted"))
        }
        Err(_) => {
            tracing::warn!(
                provider,
                external_id = %external_id,
                "Payment still processing, acknowledged before completion"
            );
            Ok(ack("accepted"))
        }
    }
}
