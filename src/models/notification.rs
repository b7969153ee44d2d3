//! Expiry notification ledger entries.

use std::fmt;

use chrono::{DateTime, Utc};

/// Which kind of entity a notice was sent for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// One individual key
    Expiry,
    /// A user's whole set of global keys, keyed without a key id
    GlobalExpiry,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Expiry => "expiry",
            NotificationKind::GlobalExpiry => "global_expiry",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `sent_notifications` ledger. Rows are inserted once and never
/// updated; old rows are pruned by retention.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SentNotification {
    pub user_id: i64,
    pub key_id: Option<i64>,
    pub kind: String,
    pub threshold_hours: i32,
    pub sent_at: DateTime<Utc>,
}
