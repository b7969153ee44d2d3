//! In-memory panel for tests.
//!
//! Holds one client table per host and a settable clock, so expiry arithmetic
//! is deterministic. Hosts can be made unreachable, slow, or made to hang to
//! drive the failure and interleaving paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ClientExpiry, PanelClient, PanelError, PanelSession, ProvisionedClient, RemoteClient,
    TrafficCounters,
};
use crate::models::host::Host;

#[derive(Default)]
struct HostState {
    unreachable: bool,
    hanging: bool,
    latency: Option<Duration>,
    clients: BTreeMap<String, RemoteClient>,
    traffic: HashMap<String, TrafficCounters>,
}

struct Inner {
    now: DateTime<Utc>,
    next_client: u64,
    hosts: HashMap<String, HostState>,
    deleted: Vec<(String, String)>,
}

/// Panel double shared by clones.
#[derive(Clone)]
pub struct InMemoryPanel {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryPanel {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                now,
                next_client: 0,
                hosts: HashMap::new(),
                deleted: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PanelError> {
        self.inner
            .lock()
            .map_err(|_| PanelError::Unreachable("panel state poisoned".to_string()))
    }

    fn with_host<T>(&self, host_name: &str, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(inner.hosts.entry(host_name.to_string()).or_default())
    }

    /// Move the panel's clock.
    pub fn set_now(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.now = now;
    }

    pub fn set_unreachable(&self, host_name: &str, unreachable: bool) {
        self.with_host(host_name, |host| host.unreachable = unreachable);
    }

    /// Make every call against the host block until it is cancelled.
    pub fn set_hanging(&self, host_name: &str, hanging: bool) {
        self.with_host(host_name, |host| host.hanging = hanging);
    }

    /// Delay every call against the host, so concurrent callers interleave.
    pub fn set_latency(&self, host_name: &str, latency: Option<Duration>) {
        self.with_host(host_name, |host| host.latency = latency);
    }

    /// Add a client directly, as other tooling sharing the panel would.
    pub fn insert_client(&self, host_name: &str, client: RemoteClient) {
        self.with_host(host_name, |host| {
            host.clients.insert(client.alias.clone(), client);
        });
    }

    /// Drop a client directly, as a panel operator would.
    pub fn remove_client(&self, host_name: &str, alias: &str) -> Option<RemoteClient> {
        self.with_host(host_name, |host| host.clients.remove(alias))
    }

    pub fn set_expiry(&self, host_name: &str, alias: &str, expiry_ms: i64) {
        self.with_host(host_name, |host| {
            if let Some(client) = host.clients.get_mut(alias) {
                client.expiry_ms = expiry_ms;
            }
        });
    }

    pub fn set_traffic(&self, host_name: &str, alias: &str, counters: TrafficCounters) {
        self.with_host(host_name, |host| {
            host.traffic.insert(alias.to_string(), counters);
        });
    }

    pub fn client(&self, host_name: &str, alias: &str) -> Option<RemoteClient> {
        self.with_host(host_name, |host| host.clients.get(alias).cloned())
    }

    pub fn clients(&self, host_name: &str) -> Vec<RemoteClient> {
        self.with_host(host_name, |host| host.clients.values().cloned().collect())
    }

    /// `(host, alias)` pairs removed through [`PanelClient::delete_client`].
    pub fn deleted(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.deleted.clone()
    }

    /// Fail or stall the way the configured host would.
    async fn reach(&self, host_name: &str) -> Result<(), PanelError> {
        let (unreachable, hanging, latency) = {
            let mut inner = self.lock()?;
            let host = inner.hosts.entry(host_name.to_string()).or_default();
            (host.unreachable, host.hanging, host.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if unreachable {
            return Err(PanelError::Unreachable(format!("{host_name} is down")));
        }
        Ok(())
    }
}

fn descriptor(session: &PanelSession, client_id: &str) -> String {
    format!(
        "vless://{client_id}@{}:443?type=tcp&security=none#{}",
        session.public_host, session.host_name
    )
}

#[async_trait]
impl PanelClient for InMemoryPanel {
    async fn login(&self, host: &Host) -> Result<PanelSession, PanelError> {
        self.reach(&host.host_name).await?;
        Ok(PanelSession {
            host_name: host.host_name.clone(),
            base_url: host.host_url.trim_end_matches('/').to_string(),
            inbound_id: host.inbound_id,
            public_host: format!("{}.example.net", host.slug()),
            cookie: None,
        })
    }

    async fn list_clients(&self, session: &PanelSession) -> Result<Vec<RemoteClient>, PanelError> {
        self.reach(&session.host_name).await?;
        Ok(self.clients(&session.host_name))
    }

    async fn upsert_client(
        &self,
        session: &PanelSession,
        alias: &str,
        expiry: ClientExpiry,
        _owner_id: i64,
    ) -> Result<ProvisionedClient, PanelError> {
        self.reach(&session.host_name).await?;

        let mut inner = self.lock()?;
        let now_ms = inner.now.timestamp_millis();
        inner.next_client += 1;
        let fresh_id = format!("client-{}", inner.next_client);

        let host = inner.hosts.entry(session.host_name.clone()).or_default();
        let current_ms = host.clients.get(alias).map(|client| client.expiry_ms);
        let client = host
            .clients
            .entry(alias.to_string())
            .or_insert_with(|| RemoteClient {
                client_id: fresh_id,
                alias: alias.to_string(),
                expiry_ms: 0,
                enabled: true,
                flow: None,
            });
        client.expiry_ms = expiry.resolve(current_ms, now_ms);
        client.enabled = true;

        Ok(ProvisionedClient {
            client_id: client.client_id.clone(),
            alias: client.alias.clone(),
            expiry_ms: client.expiry_ms,
            connection_descriptor: Some(descriptor(session, &client.client_id)),
        })
    }

    async fn delete_client(&self, session: &PanelSession, alias: &str) -> Result<bool, PanelError> {
        self.reach(&session.host_name).await?;

        let mut inner = self.lock()?;
        let removed = inner
            .hosts
            .get_mut(&session.host_name)
            .and_then(|host| host.clients.remove(alias))
            .is_some();
        if removed {
            inner
                .deleted
                .push((session.host_name.clone(), alias.to_string()));
        }
        Ok(removed)
    }

    async fn connection_descriptor(
        &self,
        session: &PanelSession,
        alias: &str,
    ) -> Result<Option<String>, PanelError> {
        self.reach(&session.host_name).await?;
        Ok(self
            .client(&session.host_name, alias)
            .map(|client| descriptor(session, &client.client_id)))
    }

    async fn client_traffic(
        &self,
        session: &PanelSession,
        alias: &str,
    ) -> Result<Option<TrafficCounters>, PanelError> {
        self.reach(&session.host_name).await?;
        Ok(self.with_host(&session.host_name, |host| host.traffic.get(alias).copied()))
    }
}
