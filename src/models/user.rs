//! Customer accounts.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A customer of the shop, keyed by their chat id.
///
/// # Database Table
///
/// Maps to the `users` table. The subscription token is generated once at
/// registration and never rotated; it is the only credential the client app
/// needs to poll the feed.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub user_id: i64,

    pub username: Option<String>,

    pub is_banned: bool,

    /// Lifetime spend in cents
    pub total_spent_cents: i64,

    /// Lifetime purchased months
    pub total_months: i32,

    /// User who referred this one, credited on every purchase
    pub referred_by: Option<i64>,

    pub referral_balance_cents: i64,

    #[serde(skip_serializing)]
    pub subscription_token: String,

    /// Set while a payment completion is being applied for this user.
    ///
    /// Only ever flipped from `false` to `true` by a conditional update, so two
    /// concurrent completions cannot both observe it unset.
    pub pending_payment: bool,

    pub registered_at: DateTime<Utc>,
}

/// Generate a fresh opaque subscription token (64 hex characters).
pub fn generate_subscription_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_long_and_distinct() {
        let a = generate_subscription_token();
        let b = generate_subscription_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
