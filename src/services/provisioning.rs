//! Key provisioning shared by the payment gate and the feed aggregator.
//!
//! A provisioning call writes the client on the panel first and then upserts
//! the local key from what the panel reports, so the stored expiry always
//! matches the remote one.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    models::{
        host::Host,
        key::{Key, NewKey, from_timestamp_ms},
    },
    panel::{ClientExpiry, PanelClient, PanelError, PanelSession, bounded},
    store::EntitlementStore,
};

use super::ServiceError;

/// What to write for one host.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub user_id: i64,
    pub alias: String,
    /// Extension for purchases, an absolute end for aggregator top-ups
    pub expiry: ClientExpiry,
    /// Plan tag stored on the key
    pub plan_id: i64,
}

/// Writes keys to panels and mirrors them locally. Every panel call is
/// bounded by the configured timeout.
pub struct Provisioner {
    store: Arc<dyn EntitlementStore>,
    panel: Arc<dyn PanelClient>,
    timeout: Duration,
}

impl Provisioner {
    /// # Arguments
    ///
    /// * `store` - receives the local mirror of each provisioned key
    /// * `panel` - the 3x-ui client (or the in-memory panel in tests)
    /// * `timeout` - bound on every login and upsert (`PANEL_TIMEOUT_SECS`)
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        panel: Arc<dyn PanelClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            panel,
            timeout,
        }
    }

    pub fn panel(&self) -> &Arc<dyn PanelClient> {
        &self.panel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Log in to a host, bounded by the panel timeout.
    pub async fn session(&self, host: &Host) -> Result<PanelSession, PanelError> {
        bounded(self.timeout, self.panel.login(host)).await
    }

    /// Create or extend the key described by `request` on `host`.
    ///
    /// # Errors
    ///
    /// - `Panel`: login or the client write failed or timed out; nothing was
    ///   stored locally
    /// - `Store`: the panel was updated but the local upsert failed; the next
    ///   reconciliation pass has no local key to compare and reports the
    ///   client as an orphan
    pub async fn provision(&self, host: &Host, request: &ProvisionRequest) -> Result<Key, ServiceError> {
        let session = self.session(host).await?;

        let client = bounded(
            self.timeout,
            self.panel
                .upsert_client(&session, &request.alias, request.expiry, request.user_id),
        )
        .await?;

        let key = self
            .store
            .upsert_key(&NewKey {
                user_id: request.user_id,
                host_name: host.host_name.clone(),
                client_id: client.client_id,
                alias: client.alias,
                expires_at: from_timestamp_ms(client.expiry_ms),
                connection_descriptor: client.connection_descriptor,
                plan_id: request.plan_id,
            })
            .await?;

        tracing::info!(
            host = %host.host_name,
            alias = %key.alias,
            user_id = key.user_id,
            expires_at = %key.expires_at,
            "Key provisioned"
        );

        Ok(key)
    }
}

/// Alias for a purchased key: `user{id}-key{n}-{host}`.
pub fn purchase_alias(user_id: i64, key_number: u32, host_slug: &str) -> String {
    format!("user{user_id}-key{key_number}-{host_slug}")
}

/// Alias for a key the aggregator adds to a global subscription:
/// `user{id}-global-{host}`.
pub fn global_alias(user_id: i64, host_slug: &str) -> String {
    format!("user{user_id}-global-{host_slug}")
}

/// One more than the highest purchase number among the user's aliases.
pub fn next_key_number(keys: &[Key], user_id: i64) -> u32 {
    let prefix = format!("user{user_id}-key");
    keys.iter()
        .filter_map(|key| key.alias.strip_prefix(&prefix))
        .filter_map(|rest| rest.split('-').next())
        .filter_map(|number| number.parse::<u32>().ok())
        .max()
        .map_or(1, |highest| highest + 1)
}
