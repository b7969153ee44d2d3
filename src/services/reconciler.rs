//! Reconciliation between local keys and remote panel state.
//!
//! One pass walks every enabled host in turn. Per host:
//!
//! 1. Log in and fetch the full client list; failure skips only this host.
//! 2. For every local key on the host, decide a [`KeyAction`] and apply it.
//!    A failing key is logged and the walk continues. A key whose panel
//!    expiry moved forward has its expiry notices re-armed.
//! 3. Remote clients no local key matched are orphans. They are logged and
//!    left alone, since the panel may be shared with other tooling.
//!
//! The decision itself ([`plan_key_action`]) is a pure function of the key,
//! its remote counterpart, the clock and the grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    models::{
        host::Host,
        key::{Key, TombstoneState, from_timestamp_ms},
    },
    panel::{PanelClient, PanelSession, RemoteClient, bounded},
    store::{EntitlementStore, StoreResult},
};

use super::{ServiceError, notifier::rearm};

/// Remote and local expiries closer than this are considered equal.
pub const EXPIRY_TOLERANCE_MS: i64 = 1_000;

/// What a pass does with one local key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Expired beyond the grace period: best-effort remote delete, then
    /// unconditional local delete.
    HardDelete,
    /// Present remotely with a different expiry: take the remote values.
    SyncFromRemote {
        client_id: String,
        expires_at: DateTime<Utc>,
    },
    /// Present remotely and in agreement. A tombstoned key has reappeared and
    /// loses its tombstone.
    Confirm { restore: bool },
    /// Absent remotely: tombstone it (first-seen is kept on repeat misses).
    MarkMissing,
}

/// Decide what to do with `key` given the panel's view of its alias.
pub fn plan_key_action(
    key: &Key,
    remote: Option<&RemoteClient>,
    now: DateTime<Utc>,
    grace_period: chrono::Duration,
) -> KeyAction {
    if now - key.expires_at > grace_period {
        return KeyAction::HardDelete;
    }

    let restore = matches!(key.state(), TombstoneState::Missing { .. });
    match remote {
        // Zero is the panel's "never expires"; local expiry stays in charge
        Some(client) if client.expiry_ms <= 0 => KeyAction::Confirm { restore },
        Some(client) if (client.expiry_ms - key.expiry_ms()).abs() > EXPIRY_TOLERANCE_MS => {
            KeyAction::SyncFromRemote {
                client_id: client.client_id.clone(),
                expires_at: from_timestamp_ms(client.expiry_ms),
            }
        }
        Some(_) => KeyAction::Confirm { restore },
        None => KeyAction::MarkMissing,
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub hosts_checked: usize,
    pub unavailable_hosts: Vec<String>,
    pub updated: usize,
    pub restored: usize,
    pub marked_missing: usize,
    pub deleted: usize,
    pub failed_keys: usize,
    pub orphans: usize,
}

/// Periodic diff of local keys against each host's panel.
pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    panel: Arc<dyn PanelClient>,
    grace_period: chrono::Duration,
    timeout: Duration,
}

impl Reconciler {
    /// Build a reconciler.
    ///
    /// # Arguments
    ///
    /// * `grace_period` - how long past expiry a key is kept before it is
    ///   deleted locally and remotely
    /// * `timeout` - bound on every panel call, so one hung host cannot stall
    ///   the pass
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        panel: Arc<dyn PanelClient>,
        grace_period: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            panel,
            grace_period,
            timeout,
        }
    }

    /// Reconcile every enabled host, one after another.
    ///
    /// # Errors
    ///
    /// Only a failure to list the hosts themselves is returned. Unreachable
    /// hosts and failing keys are logged and counted in the report.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for host in self.store.hosts(true).await? {
            match self.reconcile_host(&host, now, &mut report).await {
                Ok(()) => report.hosts_checked += 1,
                Err(e) => {
                    tracing::warn!(host = %host.host_name, error = %e, "Host unavailable, skipping");
                    report.unavailable_hosts.push(host.host_name.clone());
                }
            }
        }

        tracing::info!(
            hosts = report.hosts_checked,
            unavailable = report.unavailable_hosts.len(),
            updated = report.updated,
            restored = report.restored,
            marked_missing = report.marked_missing,
            deleted = report.deleted,
            failed = report.failed_keys,
            orphans = report.orphans,
            "Reconciliation pass finished"
        );

        Ok(report)
    }

    async fn reconcile_host(
        &self,
        host: &Host,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), ServiceError> {
        let session = bounded(self.timeout, self.panel.login(host)).await?;
        let clients = bounded(self.timeout, self.panel.list_clients(&session)).await?;
        let mut unmatched: HashMap<String, RemoteClient> = clients
            .into_iter()
            .map(|client| (client.alias.clone(), client))
            .collect();

        let keys = self.store.keys_for_host(&host.host_name).await?;

        for key in keys {
            let remote = unmatched.remove(&key.alias);
            let action = plan_key_action(&key, remote.as_ref(), now, self.grace_period);

            if let Err(e) = self.apply(&session, &key, action, now, report).await {
                tracing::error!(
                    host = %host.host_name,
                    alias = %key.alias,
                    error = %e,
                    "Failed to reconcile key"
                );
                report.failed_keys += 1;
            }
        }

        for alias in unmatched.keys() {
            tracing::warn!(host = %host.host_name, alias = %alias, "Panel client is not tracked locally");
            report.orphans += 1;
        }

        Ok(())
    }

    async fn apply(
        &self,
        session: &PanelSession,
        key: &Key,
        action: KeyAction,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), ServiceError> {
        match action {
            KeyAction::HardDelete => {
                if let Err(e) =
                    bounded(self.timeout, self.panel.delete_client(session, &key.alias)).await
                {
                    tracing::warn!(
                        host = %key.host_name,
                        alias = %key.alias,
                        error = %e,
                        "Remote delete failed, deleting locally anyway"
                    );
                }
                self.store.delete_key(&key.alias).await?;
                tracing::info!(
                    host = %key.host_name,
                    alias = %key.alias,
                    expired_at = %key.expires_at,
                    "Key expired beyond grace period, deleted"
                );
                report.deleted += 1;
            }
            KeyAction::SyncFromRemote {
                client_id,
                expires_at,
            } => {
                self.store
                    .sync_key_from_remote(&key.alias, &client_id, expires_at)
                    .await?;
                tracing::info!(
                    host = %key.host_name,
                    alias = %key.alias,
                    local = %key.expires_at,
                    remote = %expires_at,
                    "Local expiry replaced by panel value"
                );
                report.updated += 1;

                // Renewed on the panel: its thresholds apply to the new expiry
                if expires_at > key.expires_at {
                    let global_plan_ids = self.store.global_plan_ids().await?;
                    rearm(self.store.as_ref(), key, &global_plan_ids).await?;
                }
            }
            KeyAction::Confirm { restore: true } => {
                self.store.clear_missing_marker(&key.alias).await?;
                tracing::info!(host = %key.host_name, alias = %key.alias, "Key reappeared on panel");
                report.restored += 1;
            }
            KeyAction::Confirm { restore: false } => {}
            KeyAction::MarkMissing => {
                if self
                    .store
                    .mark_key_missing(&key.alias, &key.host_name, now)
                    .await?
                {
                    tracing::warn!(host = %key.host_name, alias = %key.alias, "Key missing on panel");
                    report.marked_missing += 1;
                }
            }
        }

        Ok(())
    }
}
