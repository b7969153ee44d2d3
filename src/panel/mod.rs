//! Remote provisioning panels.
//!
//! The engine never talks HTTP to a panel directly; it goes through
//! [`PanelClient`]. [`XuiPanel`] speaks the 3x-ui web API, [`InMemoryPanel`]
//! keeps clients in memory for tests.
//!
//! Every call made on behalf of the engine is wrapped in [`bounded`], so a
//! hung panel surfaces as [`PanelError::Timeout`] instead of stalling a
//! reconciliation pass or a feed request.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::host::Host;

pub mod memory;
pub mod xui;

pub use memory::InMemoryPanel;
pub use xui::XuiPanel;

/// Failures talking to a panel. All of them are transient from the engine's
/// point of view: the host is skipped and retried on the next cycle or request.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("Panel unreachable: {0}")]
    Unreachable(String),

    #[error("Panel call timed out")]
    Timeout,

    #[error("Panel login failed: {0}")]
    Auth(String),

    #[error("Panel rejected the request: {0}")]
    Rejected(String),

    #[error("Unexpected panel response: {0}")]
    Decode(String),
}

/// An authenticated connection to one host's inbound.
#[derive(Debug, Clone)]
pub struct PanelSession {
    pub host_name: String,

    /// Panel base URL without a trailing slash
    pub base_url: String,

    pub inbound_id: i32,

    /// Hostname clients connect to
    pub public_host: String,

    /// Session cookie returned by the login call
    pub cookie: Option<String>,
}

/// A client as the panel reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteClient {
    pub client_id: String,
    pub alias: String,
    /// Expiry in Unix milliseconds, 0 for "never"
    pub expiry_ms: i64,
    pub enabled: bool,
    pub flow: Option<String>,
}

/// Result of creating or extending a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedClient {
    pub client_id: String,
    pub alias: String,
    pub expiry_ms: i64,
    pub connection_descriptor: Option<String>,
}

/// How a client write moves the remote expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExpiry {
    /// Add to the remote expiry while it is still in the future, otherwise
    /// to the panel's current time. Used for purchases.
    Extend(chrono::Duration),
    /// Run until this instant. A later remote expiry is kept, so repeating
    /// the write is a no-op.
    Until(DateTime<Utc>),
}

impl ClientExpiry {
    /// The expiry to write, given the client's current one (if it exists)
    /// and the panel clock, all in Unix milliseconds.
    pub fn resolve(self, current_ms: Option<i64>, now_ms: i64) -> i64 {
        match self {
            ClientExpiry::Extend(delta) => {
                let base = current_ms.filter(|ms| *ms > now_ms).unwrap_or(now_ms);
                base + delta.num_milliseconds()
            }
            ClientExpiry::Until(at) => current_ms.unwrap_or(0).max(at.timestamp_millis()),
        }
    }
}

/// Traffic counters for one client, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficCounters {
    pub up: i64,
    pub down: i64,
    /// Quota; zero or negative means unlimited
    pub total: i64,
}

impl TrafficCounters {
    pub fn is_unlimited(&self) -> bool {
        self.total <= 0
    }
}

/// Capability interface to a provisioning panel.
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Authenticate and resolve the host's inbound.
    async fn login(&self, host: &Host) -> Result<PanelSession, PanelError>;

    /// Every client on the session's inbound.
    async fn list_clients(&self, session: &PanelSession) -> Result<Vec<RemoteClient>, PanelError>;

    /// Create the client, or update it when the alias already exists.
    ///
    /// The written expiry is `expiry` resolved against the client's current
    /// one; see [`ClientExpiry::resolve`].
    async fn upsert_client(
        &self,
        session: &PanelSession,
        alias: &str,
        expiry: ClientExpiry,
        owner_id: i64,
    ) -> Result<ProvisionedClient, PanelError>;

    /// Remove a client. Returns `false` when the alias was not present.
    async fn delete_client(&self, session: &PanelSession, alias: &str) -> Result<bool, PanelError>;

    /// Build the connection URI for an existing client.
    async fn connection_descriptor(
        &self,
        session: &PanelSession,
        alias: &str,
    ) -> Result<Option<String>, PanelError>;

    /// Current traffic counters for a client, if the panel tracks it.
    async fn client_traffic(
        &self,
        session: &PanelSession,
        alias: &str,
    ) -> Result<Option<TrafficCounters>, PanelError>;
}

/// Run a panel call with a deadline.
///
/// # Errors
///
/// Returns [`PanelError::Timeout`] when `limit` elapses first, otherwise the
/// call's own result.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, PanelError>
where
    F: Future<Output = Result<T, PanelError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| PanelError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_turns_a_hang_into_timeout() {
        let result: Result<(), PanelError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(PanelError::Timeout)));
    }

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, PanelError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn extension_starts_from_the_later_of_remote_expiry_and_now() {
        let day = chrono::Duration::days(1);
        let now_ms = 1_000_000;

        assert_eq!(ClientExpiry::Extend(day).resolve(None, now_ms), now_ms + day.num_milliseconds());
        assert_eq!(
            ClientExpiry::Extend(day).resolve(Some(now_ms - 5), now_ms),
            now_ms + day.num_milliseconds()
        );
        assert_eq!(
            ClientExpiry::Extend(day).resolve(Some(now_ms + 10), now_ms),
            now_ms + 10 + day.num_milliseconds()
        );
    }

    #[test]
    fn absolute_expiry_is_idempotent_and_never_shortens() {
        let at = DateTime::<Utc>::from_timestamp_millis(5_000_000).unwrap();
        let until = ClientExpiry::Until(at);

        let first = until.resolve(None, 1_000);
        assert_eq!(first, 5_000_000);
        assert_eq!(until.resolve(Some(first), 1_000), 5_000_000);
        assert_eq!(until.resolve(Some(9_000_000), 1_000), 9_000_000);
    }

    #[test]
    fn non_positive_quota_is_unlimited() {
        assert!(TrafficCounters { up: 1, down: 1, total: 0 }.is_unlimited());
        assert!(!TrafficCounters { up: 1, down: 1, total: 10 }.is_unlimited());
    }
}
