//! Payment log entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Status written for a payment whose entitlements were delivered.
pub const STATUS_PAID: &str = "paid";
/// Status written when the payment arrived but no key could be provisioned.
pub const STATUS_FAILED: &str = "failed";

/// An immutable record of a completed (or attempted) payment.
///
/// # Database Table
///
/// Maps to the `transactions` table. Rows are written once by the payment
/// gate and only read afterwards, for audit and support lookups.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Transaction {
    pub transaction_id: Uuid,

    pub user_id: i64,

    /// [`STATUS_PAID`] or [`STATUS_FAILED`]
    pub status: String,

    /// Amount in cents
    pub amount_cents: i64,

    pub payment_method: String,

    /// Provider that delivered the callback
    pub provider: String,

    /// Provider-scoped id the callback was deduplicated on
    pub external_id: String,

    pub plan_id: Option<i64>,

    pub host_name: Option<String>,

    /// Free-form details (plan name, customer email, failed hosts)
    pub metadata: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

/// Fields of a transaction about to be logged.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: i64,
    pub status: &'static str,
    pub amount_cents: i64,
    pub payment_method: String,
    pub provider: String,
    pub external_id: String,
    pub plan_id: Option<i64>,
    pub host_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
