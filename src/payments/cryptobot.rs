//! CryptoBot (Crypto Pay API) callbacks.
//!
//! Updates are signed with `crypto-pay-api-signature`:
//! hex(HMAC-SHA256(key = SHA-256(api token), raw body)). Only `invoice_paid`
//! updates whose invoice status is `paid` are applied. The invoice `payload`
//! holds the colon-delimited purchase metadata.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{PaymentError, RawMetadata, Verdict};
use crate::models::webhook::{ExternalId, PaymentCallback};

type HmacSha256 = Hmac<Sha256>;

pub const PROVIDER: &str = "cryptobot";

pub const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";

const METADATA_FIELDS: usize = 9;

#[derive(Debug, Deserialize)]
struct Update {
    update_type: String,
    #[serde(default)]
    payload: Option<Invoice>,
}

#[derive(Debug, Deserialize)]
struct Invoice {
    #[serde(default)]
    invoice_id: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

fn mac_for(api_token: &str) -> Option<HmacSha256> {
    let key = Sha256::digest(api_token.as_bytes());
    HmacSha256::new_from_slice(&key).ok()
}

/// Signature CryptoBot would send for `body`.
pub fn sign(api_token: &str, body: &[u8]) -> Option<String> {
    let mut mac = mac_for(api_token)?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature header in constant time.
pub fn verify_signature(api_token: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Some(mut mac) = mac_for(api_token) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Split `user:months:price:action:key_id:host:plan_id:email:method`.
///
/// # Errors
///
/// Returns [`PaymentError::Malformed`] when fewer than nine fields are present.
pub fn parse_metadata(payload: &str) -> Result<RawMetadata, PaymentError> {
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() < METADATA_FIELDS {
        return Err(PaymentError::Malformed(format!(
            "expected {METADATA_FIELDS} payload fields, got {}",
            parts.len()
        )));
    }

    Ok(RawMetadata {
        user_id: parts[0].to_string(),
        price: parts[2].to_string(),
        action: parts[3].to_string(),
        key_id: parts[4].to_string(),
        host_name: parts[5].to_string(),
        plan_id: parts[6].to_string(),
        customer_email: parts[7].to_string(),
        payment_method: parts[8].to_string(),
    })
}

/// Decode a verified update body.
///
/// # Errors
///
/// Returns [`PaymentError::Malformed`] for bodies that are not a Crypto Pay
/// update or whose metadata cannot be typed.
pub fn parse_update(body: &[u8]) -> Result<Verdict, PaymentError> {
    let update: Update = serde_json::from_slice(body)
        .map_err(|e| PaymentError::Malformed(format!("invalid update body: {e}")))?;

    if update.update_type != "invoice_paid" {
        return Ok(Verdict::Ignored(format!("update type {}", update.update_type)));
    }

    let Some(invoice) = update.payload else {
        return Err(PaymentError::Malformed("invoice_paid without invoice".to_string()));
    };

    if let Some(status) = invoice.status.as_deref() {
        if status != "paid" {
            return Ok(Verdict::Ignored(format!("invoice status {status}")));
        }
    }

    let payload = invoice.payload.unwrap_or_default();
    if payload.trim().is_empty() {
        return Ok(Verdict::Ignored("paid invoice without payload".to_string()));
    }

    let external_id = match invoice.invoice_id.as_ref().and_then(id_string) {
        Some(id) => ExternalId::Native(id),
        None => ExternalId::digest_of(&payload),
    };

    let payment = parse_metadata(&payload)?.into_payment()?;

    Ok(Verdict::Payment(PaymentCallback {
        provider: PROVIDER,
        external_id,
        payment,
    }))
}

/// Provider ids arrive as numbers or strings.
pub(crate) fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
