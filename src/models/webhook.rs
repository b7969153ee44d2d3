//! Payment callback models.
//!
//! Every provider delivers its own payload shape (JSON objects, colon-separated
//! strings). Provider adapters decode and verify those payloads and produce a
//! [`PaymentCallback`]: a provider-scoped external id plus one
//! [`CompletedPayment`]. The payment gate only ever sees this normalized form.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What the buyer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PaymentAction {
    /// Issue a key (or reuse the paid key already held on the target host)
    New,
    /// Extend one specific key owned by the buyer
    Extend { key_id: i64 },
}

/// A verified, provider-agnostic payment completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPayment {
    pub user_id: i64,
    pub plan_id: i64,
    /// Target host as carried in the payment metadata; the plan's own host is
    /// used when absent.
    pub host_name: Option<String>,
    pub action: PaymentAction,
    pub price_cents: i64,
    pub payment_method: String,
    pub customer_email: Option<String>,
}

impl CompletedPayment {
    /// Check the decoded payload is complete enough to act on.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id <= 0 {
            return Err(format!("invalid user id {}", self.user_id));
        }
        if self.plan_id <= 0 {
            return Err(format!("invalid plan id {}", self.plan_id));
        }
        if self.price_cents < 0 {
            return Err("negative price".to_string());
        }
        if let PaymentAction::Extend { key_id } = self.action {
            if key_id <= 0 {
                return Err(format!("invalid key id {key_id} for extension"));
            }
        }
        Ok(())
    }
}

/// Provider-scoped identity of a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalId {
    /// The provider's own invoice or payment id
    Native(String),
    /// SHA-256 of the payment payload, for providers that send no id
    PayloadDigest(String),
}

impl ExternalId {
    pub fn digest_of(payload: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        ExternalId::PayloadDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ExternalId::Native(id) | ExternalId::PayloadDigest(id) => id,
        }
    }

    /// Native ids can be recorded before the payload is interpreted.
    pub fn is_trusted(&self) -> bool {
        matches!(self, ExternalId::Native(_))
    }
}

/// A verified callback ready for the payment gate.
#[derive(Debug, Clone)]
pub struct PaymentCallback {
    pub provider: &'static str,
    pub external_id: ExternalId,
    pub payment: CompletedPayment,
}
