//! Heleket callbacks.
//!
//! The body is a JSON object carrying a `sign` field:
//! md5(base64(canonical JSON of the body without `sign`) + api key), where
//! the canonical form has sorted keys, no whitespace and non-ASCII escaped as
//! `\uXXXX`. Only `paid` and `paid_over` statuses are applied. Purchase
//! metadata is a JSON object serialised into `description`.

use base64::{Engine, engine::general_purpose::STANDARD};
use md5::{Digest, Md5};
use serde_json::{Map, Value};

use super::{PaymentError, RawMetadata, Verdict, cryptobot::id_string, secrets_match};
use crate::models::webhook::{ExternalId, PaymentCallback};

pub const PROVIDER: &str = "heleket";

const PAID_STATUSES: [&str; 2] = ["paid", "paid_over"];

/// Sorted, compact JSON with non-ASCII characters escaped.
pub fn canonical_json(fields: &Map<String, Value>) -> String {
    let compact = sorted(&Value::Object(fields.clone())).to_string();

    let mut escaped = String::with_capacity(compact.len());
    for c in compact.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    escaped
}

/// Rebuild objects with keys inserted in order, whatever map backs `Value`.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|key| (key.clone(), sorted(&map[key.as_str()])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// The `sign` value for `fields` (which must not contain `sign`).
pub fn sign(fields: &Map<String, Value>, api_key: &str) -> String {
    let encoded = STANDARD.encode(canonical_json(fields));
    hex::encode(Md5::digest(format!("{encoded}{api_key}").as_bytes()))
}

/// Verify and decode a callback body.
///
/// # Errors
///
/// - `Malformed`: the body is not a JSON object, or the paid callback's
///   metadata is missing or unusable
/// - `MissingSignature`: no `sign` field
/// - `InvalidSignature`: `sign` does not match
pub fn verify_and_parse(body: &[u8], api_key: &str) -> Result<Verdict, PaymentError> {
    let mut fields: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|e| PaymentError::Malformed(format!("invalid callback body: {e}")))?;

    let presented = match fields.remove("sign") {
        Some(Value::String(sign)) if !sign.is_empty() => sign,
        _ => return Err(PaymentError::MissingSignature),
    };

    if !secrets_match(&sign(&fields, api_key), &presented) {
        return Err(PaymentError::InvalidSignature);
    }

    let status = fields.get("status").and_then(Value::as_str).unwrap_or_default();
    if !PAID_STATUSES.contains(&status) {
        return Ok(Verdict::Ignored(format!("status {status:?}")));
    }

    let description = fields
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| PaymentError::Malformed("paid callback without description".to_string()))?;

    let external_id = match ["order_id", "uuid"]
        .iter()
        .find_map(|field| fields.get(*field).and_then(id_string))
    {
        Some(id) => ExternalId::Native(id),
        None => ExternalId::digest_of(description),
    };

    let payment = parse_metadata(description)?.into_payment()?;

    Ok(Verdict::Payment(PaymentCallback {
        provider: PROVIDER,
        external_id,
        payment,
    }))
}

/// Read the metadata object serialised into `description`.
///
/// # Errors
///
/// Returns [`PaymentError::Malformed`] if `description` is not a JSON object.
pub fn parse_metadata(description: &str) -> Result<RawMetadata, PaymentError> {
    let metadata: Map<String, Value> = serde_json::from_str(description)
        .map_err(|e| PaymentError::Malformed(format!("description is not metadata JSON: {e}")))?;

    Ok(RawMetadata::from_object(&metadata))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const API_KEY: &str = "heleket-test-key";

    fn signed(mut fields: Map<String, Value>) -> Vec<u8> {
        let signature = sign(&fields, API_KEY);
        fields.insert("sign".to_string(), Value::String(signature));
        serde_json::to_vec(&fields).unwrap()
    }

    fn metadata() -> String {
        json!({
            "user_id": 42,
            "months": 1,
            "price": 4.99,
            "action": "new",
            "key_id": 0,
            "host_name": "ALL",
            "plan_id": "3",
            "customer_email": null,
            "payment_method": "Heleket",
        })
        .to_string()
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn canonical_form_sorts_keys_and_escapes_non_ascii() {
        let canonical = canonical_json(&fields(json!({ "b": "ж", "a": 1 })));
        assert_eq!(canonical, r#"{"a":1,"b":"\u0436"}"#);
    }

    #[test]
    fn paid_callback_becomes_a_payment() {
        let body = signed(fields(json!({
            "order_id": "ord-77",
            "status": "paid_over",
            "description": metadata(),
        })));

        let Verdict::Payment(callback) = verify_and_parse(&body, API_KEY).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(callback.external_id, ExternalId::Native("ord-77".to_string()));
        assert_eq!(callback.payment.user_id, 42);
        assert_eq!(callback.payment.plan_id, 3);
        assert_eq!(callback.payment.price_cents, 499);
    }

    #[test]
    fn uuid_then_digest_serve_as_fallback_ids() {
        let with_uuid = signed(fields(json!({
            "uuid": "b1c2",
            "status": "paid",
            "description": metadata(),
        })));
        let Verdict::Payment(callback) = verify_and_parse(&with_uuid, API_KEY).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(callback.external_id.as_str(), "b1c2");

        let bare = signed(fields(json!({ "status": "paid", "description": metadata() })));
        let Verdict::Payment(callback) = verify_and_parse(&bare, API_KEY).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(callback.external_id, ExternalId::digest_of(&metadata()));
    }

    #[test]
    fn bad_or_missing_sign_is_rejected() {
        let body = signed(fields(json!({ "status": "paid", "description": metadata() })));
        assert!(matches!(
            verify_and_parse(&body, "other-key"),
            Err(PaymentError::InvalidSignature)
        ));

        let unsigned = serde_json::to_vec(&json!({ "status": "paid" })).unwrap();
        assert!(matches!(
            verify_and_parse(&unsigned, API_KEY),
            Err(PaymentError::MissingSignature)
        ));
    }

    #[test]
    fn unpaid_status_is_ignored() {
        let body = signed(fields(json!({ "status": "check", "description": metadata() })));
        assert!(matches!(verify_and_parse(&body, API_KEY).unwrap(), Verdict::Ignored(_)));
    }
}
