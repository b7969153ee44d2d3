//! YooKassa notifications.
//!
//! YooKassa does not sign its notifications. A `payment.succeeded` event is
//! only applied after the payment's status has been read back from the
//! YooKassa API with the shop's credentials, through a
//! [`PaymentStatusLookup`]. Purchase metadata is the payment's `metadata`
//! object and the payment id is the ledger key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{PaymentError, RawMetadata, Verdict};
use crate::models::webhook::{ExternalId, PaymentCallback};

pub const PROVIDER: &str = "yookassa";

/// The only event that grants anything.
pub const SUCCEEDED_EVENT: &str = "payment.succeeded";

/// Payment status the API must report before the payment is applied.
pub const SUCCEEDED: &str = "succeeded";

const API_BASE: &str = "https://api.yookassa.ru/v3";

/// Shop credentials from the runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopCredentials {
    pub shop_id: String,
    pub secret_key: String,
}

/// Capability to read a payment's current status from YooKassa.
#[async_trait]
pub trait PaymentStatusLookup: Send + Sync {
    /// `Ok(None)` when YooKassa does not know the payment.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Unavailable`] when the API cannot be reached
    /// or answers with an error.
    async fn payment_status(
        &self,
        shop: &ShopCredentials,
        payment_id: &str,
    ) -> Result<Option<String>, PaymentError>;
}

/// Reads payments through `GET /v3/payments/{id}` with HTTP basic auth.
#[derive(Debug, Clone)]
pub struct YooKassaApi {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PaymentObject {
    status: String,
}

impl YooKassaApi {
    /// # Arguments
    ///
    /// * `timeout` - bound on each status request
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Unavailable(PROVIDER, format!("HTTP client error: {e}")))?;

        Ok(Self {
            http,
            base_url: API_BASE.to_string(),
        })
    }
}

#[async_trait]
impl PaymentStatusLookup for YooKassaApi {
    async fn payment_status(
        &self,
        shop: &ShopCredentials,
        payment_id: &str,
    ) -> Result<Option<String>, PaymentError> {
        let unavailable = |e: reqwest::Error| PaymentError::Unavailable(PROVIDER, e.to_string());

        let response = self
            .http
            .get(format!("{}/payments/{payment_id}", self.base_url))
            .basic_auth(&shop.shop_id, Some(&shop.secret_key))
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payment = response
            .error_for_status()
            .map_err(unavailable)?
            .json::<PaymentObject>()
            .await
            .map_err(unavailable)?;

        Ok(Some(payment.status))
    }
}

/// Statuses held in memory. Can be switched to fail.
#[derive(Clone, Default)]
pub struct InMemoryStatusLookup {
    statuses: Arc<Mutex<HashMap<String, String>>>,
    unavailable: Arc<Mutex<bool>>,
    asked_with: Arc<Mutex<Vec<ShopCredentials>>>,
}

impl InMemoryStatusLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, payment_id: &str, status: &str) {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(payment_id.to_string(), status.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) = unavailable;
    }

    /// Credentials of every lookup so far, oldest first.
    pub fn asked_with(&self) -> Vec<ShopCredentials> {
        self.asked_with.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl PaymentStatusLookup for InMemoryStatusLookup {
    async fn payment_status(
        &self,
        shop: &ShopCredentials,
        payment_id: &str,
    ) -> Result<Option<String>, PaymentError> {
        self.asked_with
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(shop.clone());

        if *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(PaymentError::Unavailable(
                PROVIDER,
                "status lookup set to fail".to_string(),
            ));
        }

        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(payment_id)
            .cloned())
    }
}

/// A decoded notification, before its status is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Any event other than `payment.succeeded`
    Ignored(String),
    Succeeded {
        payment_id: String,
        metadata: RawMetadata,
    },
}

/// Decode a notification body.
///
/// # Errors
///
/// Returns [`PaymentError::Malformed`] when the body is not a JSON object, or
/// a succeeded event has no usable payment id or no metadata.
pub fn parse_notification(body: &[u8]) -> Result<Notification, PaymentError> {
    let fields: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|e| PaymentError::Malformed(format!("invalid notification body: {e}")))?;

    let event = fields.get("event").and_then(Value::as_str).unwrap_or_default();
    if event != SUCCEEDED_EVENT {
        return Ok(Notification::Ignored(format!("event {event:?}")));
    }

    let object = fields.get("object").and_then(Value::as_object);

    // The id goes into the API path
    let payment_id = object
        .and_then(|object| object.get("id"))
        .and_then(Value::as_str)
        .filter(|id| {
            !id.is_empty()
                && id
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
        .ok_or_else(|| PaymentError::Malformed("notification without a valid payment id".to_string()))?;

    let metadata = object
        .and_then(|object| object.get("metadata"))
        .and_then(Value::as_object)
        .filter(|metadata| !metadata.is_empty())
        .ok_or_else(|| PaymentError::Malformed("succeeded payment without metadata".to_string()))?;

    Ok(Notification::Succeeded {
        payment_id: payment_id.to_string(),
        metadata: RawMetadata::from_object(metadata),
    })
}

/// Decode a notification and confirm it against the API.
///
/// The metadata is checked before the API is asked, so a malformed
/// notification costs no outbound request.
///
/// # Errors
///
/// - `Malformed`: see [`parse_notification`], or unusable metadata
/// - `Unavailable`: the status could not be read; the provider should retry
pub async fn verify(
    lookup: &dyn PaymentStatusLookup,
    shop: &ShopCredentials,
    body: &[u8],
) -> Result<Verdict, PaymentError> {
    let (payment_id, metadata) = match parse_notification(body)? {
        Notification::Ignored(reason) => return Ok(Verdict::Ignored(reason)),
        Notification::Succeeded {
            payment_id,
            metadata,
        } => (payment_id, metadata),
    };

    let payment = metadata.into_payment()?;

    match lookup.payment_status(shop, &payment_id).await? {
        Some(status) if status == SUCCEEDED => Ok(Verdict::Payment(PaymentCallback {
            provider: PROVIDER,
            external_id: ExternalId::Native(payment_id),
            payment,
        })),
        Some(status) => {
            tracing::warn!(payment_id = %payment_id, status = %status, "YooKassa payment not succeeded according to the API");
            Ok(Verdict::Ignored(format!("API status {status:?}")))
        }
        None => {
            tracing::warn!(payment_id = %payment_id, "YooKassa payment unknown to the API");
            Ok(Verdict::Ignored("payment unknown to the API".to_string()))
        }
    }
}
