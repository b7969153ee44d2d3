//! Payment provider adapters.
//!
//! Each adapter verifies a provider's callback (signature, status) and
//! normalises its metadata into a [`PaymentCallback`] for the payment gate.
//! Metadata arrives as a colon-delimited string (CryptoBot) or as a JSON
//! object (Heleket, YooKassa); all carry the same fields:
//!
//! `user_id, months, price, action, key_id, host_name, plan_id, customer_email, payment_method`

use serde_json::{Map, Value};

use crate::models::webhook::{CompletedPayment, PaymentAction, PaymentCallback};

pub mod cryptobot;
pub mod heleket;
pub mod yookassa;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The provider's secret is not configured; its endpoint is off
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// The URL secret did not match
    #[error("Forbidden")]
    Forbidden,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Malformed callback: {0}")]
    Malformed(String),

    /// The provider's API could not confirm the payment
    #[error("{0} API unavailable: {1}")]
    Unavailable(&'static str, String),
}

/// Result of verifying a callback.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Authentic, but nothing to apply (wrong update type or unpaid status)
    Ignored(String),
    Payment(PaymentCallback),
}

/// Raw metadata fields before typing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawMetadata {
    pub user_id: String,
    pub price: String,
    pub action: String,
    pub key_id: String,
    pub host_name: String,
    pub plan_id: String,
    pub customer_email: String,
    pub payment_method: String,
}

impl RawMetadata {
    /// Read the fields from a JSON object. Values may be strings, numbers or
    /// null; anything else reads as absent.
    pub fn from_object(metadata: &Map<String, Value>) -> Self {
        let field = |name: &str| match metadata.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };

        Self {
            user_id: field("user_id"),
            price: field("price"),
            action: field("action"),
            key_id: field("key_id"),
            host_name: field("host_name"),
            plan_id: field("plan_id"),
            customer_email: field("customer_email"),
            payment_method: field("payment_method"),
        }
    }

    /// Type the fields.
    ///
    /// `"None"` and empty strings read as absent. The purchased duration is
    /// taken from the plan, so the `months` field is not carried over.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Malformed`] for unparsable numbers or an
    /// unknown action.
    pub fn into_payment(self) -> Result<CompletedPayment, PaymentError> {
        let user_id = parse_id("user_id", &self.user_id)?;
        let plan_id = parse_id("plan_id", &self.plan_id)?;
        let price_cents = parse_price_cents(&self.price)?;

        let action = match self.action.trim() {
            "new" => PaymentAction::New,
            "extend" => PaymentAction::Extend {
                key_id: parse_id("key_id", &self.key_id)?,
            },
            other => {
                return Err(PaymentError::Malformed(format!("unknown action {other:?}")));
            }
        };

        Ok(CompletedPayment {
            user_id,
            plan_id,
            host_name: present(self.host_name),
            action,
            price_cents,
            payment_method: present(self.payment_method).unwrap_or_else(|| "unknown".to_string()),
            customer_email: present(self.customer_email),
        })
    }
}

fn present(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "None" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_id(field: &str, value: &str) -> Result<i64, PaymentError> {
    value
        .trim()
        .parse()
        .map_err(|_| PaymentError::Malformed(format!("{field} is not an integer: {value:?}")))
}

/// Parse a decimal amount such as `"12.5"` into cents. Digits beyond the
/// second decimal place are dropped.
pub fn parse_price_cents(value: &str) -> Result<i64, PaymentError> {
    let malformed = || PaymentError::Malformed(format!("price is not a decimal amount: {value:?}"));
    let value = value.trim();

    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let whole: i64 = whole.parse().map_err(|_| malformed())?;
    let mut cents_digits: String = fraction.chars().take(2).collect();
    while cents_digits.len() < 2 {
        cents_digits.push('0');
    }
    let cents: i64 = cents_digits.parse().map_err(|_| malformed())?;

    whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(malformed)
}

/// Compare two secrets without short-circuiting on the first differing byte.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawMetadata {
        RawMetadata {
            user_id: "42".to_string(),
            price: "4.99".to_string(),
            action: "new".to_string(),
            key_id: "0".to_string(),
            host_name: "Netherlands".to_string(),
            plan_id: "3".to_string(),
            customer_email: "None".to_string(),
            payment_method: "USDT".to_string(),
        }
    }

    #[test]
    fn prices_convert_to_cents() {
        assert_eq!(parse_price_cents("4.99").unwrap(), 499);
        assert_eq!(parse_price_cents("12.5").unwrap(), 1250);
        assert_eq!(parse_price_cents("7").unwrap(), 700);
        assert_eq!(parse_price_cents("1.239").unwrap(), 123);
        assert!(parse_price_cents("-1").is_err());
        assert!(parse_price_cents("abc").is_err());
        assert!(parse_price_cents("").is_err());
    }

    #[test]
    fn metadata_normalises_into_a_payment() {
        let payment = raw().into_payment().unwrap();
        assert_eq!(payment.user_id, 42);
        assert_eq!(payment.price_cents, 499);
        assert_eq!(payment.action, PaymentAction::New);
        assert_eq!(payment.host_name.as_deref(), Some("Netherlands"));
        assert_eq!(payment.customer_email, None);
    }

    #[test]
    fn extend_carries_the_key_id() {
        let mut metadata = raw();
        metadata.action = "extend".to_string();
        metadata.key_id = "17".to_string();
        assert_eq!(
            metadata.into_payment().unwrap().action,
            PaymentAction::Extend { key_id: 17 }
        );
    }

    #[test]
    fn unknown_action_is_malformed() {
        let mut metadata = raw();
        metadata.action = "refund".to_string();
        assert!(matches!(metadata.into_payment(), Err(PaymentError::Malformed(_))));
    }

    #[test]
    fn object_metadata_accepts_strings_numbers_and_null() {
        let object = match serde_json::json!({
            "user_id": 42,
            "price": "4.99",
            "action": "new",
            "plan_id": 3,
            "customer_email": null,
            "host_name": ["not", "a", "string"],
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let metadata = RawMetadata::from_object(&object);
        assert_eq!(metadata.user_id, "42");
        assert_eq!(metadata.plan_id, "3");
        assert_eq!(metadata.customer_email, "");
        assert_eq!(metadata.host_name, "");
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
    }
}
