//! Keys: per-host entitlements and their tombstones.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Plan id stored on trial keys.
pub const TRIAL_PLAN_ID: i64 = 0;

/// An entitlement to one host until `expires_at`.
///
/// # Database Table
///
/// Maps to the `keys` table joined with `missing_keys`. `missing_since` is
/// the tombstone's first-seen timestamp and is `None` for keys the panel
/// still reports.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct Key {
    pub key_id: i64,

    pub user_id: i64,

    pub host_name: String,

    /// Client id assigned by the panel
    pub client_id: String,

    /// Unique provisioning alias (the panel's client "email")
    pub alias: String,

    pub expires_at: DateTime<Utc>,

    /// Cached connection URI served in the feed
    pub connection_descriptor: Option<String>,

    /// 0 for trial keys, otherwise the plan the key was bought under
    pub plan_id: i64,

    pub created_at: DateTime<Utc>,

    pub missing_since: Option<DateTime<Utc>>,
}

/// Lifecycle of a key with respect to the remote panel.
///
/// `Active -> Missing { since } -> (deleted)`. A missing key that shows up on
/// the panel again returns to `Active`; deletion removes the row entirely, so
/// it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneState {
    Active,
    Missing { since: DateTime<Utc> },
}

impl Key {
    pub fn is_trial(&self) -> bool {
        self.plan_id == TRIAL_PLAN_ID
    }

    pub fn is_paid(&self) -> bool {
        self.plan_id > TRIAL_PLAN_ID
    }

    pub fn state(&self) -> TombstoneState {
        match self.missing_since {
            Some(since) => TombstoneState::Missing { since },
            None => TombstoneState::Active,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        matches!(self.state(), TombstoneState::Missing { .. })
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn expiry_ms(&self) -> i64 {
        self.expires_at.timestamp_millis()
    }
}

/// Key fields written by provisioning. Upserted by alias.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub user_id: i64,
    pub host_name: String,
    pub client_id: String,
    pub alias: String,
    pub expires_at: DateTime<Utc>,
    pub connection_descriptor: Option<String>,
    pub plan_id: i64,
}

/// Convert a panel millisecond timestamp into a UTC instant.
///
/// Out-of-range values clamp to the Unix epoch, which reads as long expired.
pub fn from_timestamp_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
