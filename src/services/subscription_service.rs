//! Subscription feed aggregation.
//!
//! Turns a subscription token into the list of connection descriptors the
//! client app polls. Global subscribers get keys on newly enabled hosts
//! provisioned on the fly, capped at what they already paid for.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};

use crate::{
    config::settings,
    models::{host::Host, key::Key},
    panel::{ClientExpiry, PanelError, TrafficCounters, bounded},
    store::{EntitlementStore, StoreResult},
};

use super::provisioning::{ProvisionRequest, Provisioner, global_alias};

/// Reported as the traffic limit when any key has none (1 PiB).
pub const UNLIMITED_BYTES: i64 = 1 << 50;

const DEFAULT_TITLE: &str = "Subscription";
const DEFAULT_UPDATE_INTERVAL_HOURS: u32 = 12;

/// Feed settings read from the settings table on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOptions {
    pub title: String,
    pub update_interval_hours: u32,
    pub auto_provision: bool,
    pub live_stats: bool,
    pub regenerate_descriptors: bool,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            update_interval_hours: DEFAULT_UPDATE_INTERVAL_HOURS,
            auto_provision: true,
            live_stats: false,
            regenerate_descriptors: false,
        }
    }
}

impl FeedOptions {
    pub async fn load(store: &dyn EntitlementStore) -> StoreResult<Self> {
        let defaults = Self::default();

        let title = store
            .setting(settings::SUBSCRIPTION_NAME)
            .await?
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(defaults.title);

        let update_interval_hours = store
            .setting(settings::SUBSCRIPTION_UPDATE_INTERVAL_HOURS)
            .await?
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(defaults.update_interval_hours);

        let flag = |value: Option<String>, default| settings::parse_flag(value.as_deref(), default);

        Ok(Self {
            title,
            update_interval_hours,
            auto_provision: flag(
                store.setting(settings::SUBSCRIPTION_AUTO_PROVISION).await?,
                defaults.auto_provision,
            ),
            live_stats: flag(
                store.setting(settings::SUBSCRIPTION_LIVE_STATS).await?,
                defaults.live_stats,
            ),
            regenerate_descriptors: flag(
                store.setting(settings::SUBSCRIPTION_REGENERATE_DESCRIPTORS).await?,
                defaults.regenerate_descriptors,
            ),
        })
    }
}

/// Traffic and expiry advertised in the `Subscription-Userinfo` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub upload: i64,
    pub download: i64,
    pub total: i64,
    /// Unix seconds of the earliest served expiry, 0 when nothing is served
    pub expire: i64,
}

/// A rendered feed, ready to be written to the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFeed {
    pub title: String,
    pub update_interval_hours: u32,
    pub descriptors: Vec<String>,
    pub usage: UsageSummary,
}

impl SubscriptionFeed {
    /// Newline-joined descriptors, base64 encoded as a whole.
    pub fn encoded_body(&self) -> String {
        STANDARD.encode(self.descriptors.join("\n"))
    }

    pub fn userinfo_header(&self) -> String {
        format!(
            "upload={}; download={}; total={}; expire={}",
            self.usage.upload, self.usage.download, self.usage.total, self.usage.expire
        )
    }
}

/// The keys a user's global entitlement covers, if they have one.
///
/// Keys tagged with a global plan are global. Untagged holders of keys on at
/// least two hosts are treated as global as a whole, as long as a global plan
/// exists; such keys predate plan tagging.
pub fn global_set<'a>(active: &'a [Key], global_plan_ids: &BTreeSet<i64>) -> Option<Vec<&'a Key>> {
    let linked: Vec<&Key> = active
        .iter()
        .filter(|key| global_plan_ids.contains(&key.plan_id))
        .collect();
    if !linked.is_empty() {
        return Some(linked);
    }

    let hosts: BTreeSet<&str> = active.iter().map(|key| key.host_name.as_str()).collect();
    if hosts.len() >= 2 && !global_plan_ids.is_empty() {
        return Some(active.iter().collect());
    }

    None
}

/// Keep only the latest-expiring key per host, ordered by host name.
pub fn latest_per_host(keys: Vec<Key>) -> BTreeMap<String, Key> {
    let mut by_host: BTreeMap<String, Key> = BTreeMap::new();
    for key in keys {
        let newer = by_host
            .get(&key.host_name)
            .is_none_or(|kept| key.expires_at > kept.expires_at);
        if newer {
            by_host.insert(key.host_name.clone(), key);
        }
    }
    by_host
}

/// Builds subscription feeds.
pub struct SubscriptionService {
    store: Arc<dyn EntitlementStore>,
    provisioner: Arc<Provisioner>,
    traffic_timeout: Duration,
}

impl SubscriptionService {
    /// # Arguments
    ///
    /// * `store` - users, keys, hosts and the feed settings
    /// * `provisioner` - auto-provisions global subscriptions on new hosts
    /// * `traffic_timeout` - bound on each live traffic fetch
    ///
    /// # Configuration
    ///
    /// Feed behaviour is read per request from the runtime settings
    /// (`subscription_auto_provision`, `subscription_live_stats`,
    /// `subscription_regenerate_descriptors` and the header values).
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        provisioner: Arc<Provisioner>,
        traffic_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            traffic_timeout,
        }
    }

    /// Build the feed for `token`.
    ///
    /// Returns `Ok(None)` when no user holds the token. An empty feed is
    /// `Ok(Some(..))` with no descriptors.
    ///
    /// # Errors
    ///
    /// Only store failures fail the request. Panel failures drop the
    /// affected host from the result.
    pub async fn build_feed(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SubscriptionFeed>> {
        let Some(user) = self.store.user_by_token(token).await? else {
            return Ok(None);
        };

        let options = FeedOptions::load(self.store.as_ref()).await?;
        let global_plan_ids = self.store.global_plan_ids().await?;
        let enabled_hosts = self.store.hosts(true).await?;

        let mut keys: Vec<Key> = self
            .store
            .keys_for_user(user.user_id)
            .await?
            .into_iter()
            .filter(|key| key.is_paid() && key.is_live_at(now))
            .collect();

        if options.auto_provision {
            let added = self
                .provision_missing_hosts(user.user_id, &keys, &global_plan_ids, &enabled_hosts, now)
                .await;
            keys.extend(added);
        }

        let enabled: HashSet<&str> = enabled_hosts.iter().map(|h| h.host_name.as_str()).collect();
        keys.retain(|key| enabled.contains(key.host_name.as_str()) && !key.is_tombstoned());

        let mut descriptors = Vec::new();
        let mut served = Vec::new();
        let mut seen = HashSet::new();

        for (_, key) in latest_per_host(keys) {
            let descriptor = match key.connection_descriptor.clone() {
                Some(descriptor) => Some(descriptor),
                None if options.regenerate_descriptors => {
                    let host = enabled_hosts.iter().find(|h| h.host_name == key.host_name);
                    match host {
                        Some(host) => self.regenerate_descriptor(host, &key).await,
                        None => None,
                    }
                }
                None => None,
            };

            let Some(descriptor) = descriptor else {
                tracing::debug!(alias = %key.alias, "Key has no descriptor, left out of feed");
                continue;
            };
            if seen.insert(descriptor.clone()) {
                descriptors.push(descriptor);
                served.push(key);
            }
        }

        let usage = self.usage(&served, &enabled_hosts, options.live_stats).await;

        Ok(Some(SubscriptionFeed {
            title: options.title,
            update_interval_hours: options.update_interval_hours,
            descriptors,
            usage,
        }))
    }

    /// Provision keys for a global subscriber on enabled hosts where they
    /// hold no active paid key.
    ///
    /// The new keys run until the soonest expiry of the existing global keys.
    /// The panel is given that instant rather than a duration, so concurrent
    /// polls that both miss the new key write the same expiry. Hosts that
    /// fail are skipped.
    async fn provision_missing_hosts(
        &self,
        user_id: i64,
        active: &[Key],
        global_plan_ids: &BTreeSet<i64>,
        enabled_hosts: &[Host],
        now: DateTime<Utc>,
    ) -> Vec<Key> {
        let Some(global) = global_set(active, global_plan_ids) else {
            return Vec::new();
        };
        let Some(soonest) = global.iter().min_by_key(|key| key.expires_at) else {
            return Vec::new();
        };

        if soonest.expires_at <= now {
            return Vec::new();
        }

        let plan_id = if global_plan_ids.contains(&soonest.plan_id) {
            soonest.plan_id
        } else {
            match global_plan_ids.iter().next() {
                Some(id) => *id,
                None => return Vec::new(),
            }
        };

        let covered: HashSet<&str> = active.iter().map(|key| key.host_name.as_str()).collect();
        let mut added = Vec::new();

        for host in enabled_hosts
            .iter()
            .filter(|host| !covered.contains(host.host_name.as_str()))
        {
            let request = ProvisionRequest {
                user_id,
                alias: global_alias(user_id, &host.slug()),
                expiry: ClientExpiry::Until(soonest.expires_at),
                plan_id,
            };

            match self.provisioner.provision(host, &request).await {
                Ok(key) => {
                    tracing::info!(
                        user_id,
                        host = %host.host_name,
                        expires_at = %key.expires_at,
                        "Global subscription extended to new host"
                    );
                    added.push(key);
                }
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        host = %host.host_name,
                        error = %e,
                        "Could not provision global key, host skipped"
                    );
                }
            }
        }

        added
    }

    /// Ask the panel for a key's descriptor and cache it.
    async fn regenerate_descriptor(&self, host: &Host, key: &Key) -> Option<String> {
        match self.fetch_descriptor(host, key).await {
            Ok(Some(descriptor)) => {
                if let Err(e) = self.store.set_key_descriptor(key.key_id, &descriptor).await {
                    tracing::warn!(alias = %key.alias, error = %e, "Could not cache descriptor");
                }
                Some(descriptor)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    host = %host.host_name,
                    alias = %key.alias,
                    error = %e,
                    "Descriptor regeneration failed"
                );
                None
            }
        }
    }

    async fn fetch_descriptor(&self, host: &Host, key: &Key) -> Result<Option<String>, PanelError> {
        let session = self.provisioner.session(host).await?;
        bounded(
            self.provisioner.timeout(),
            self.provisioner.panel().connection_descriptor(&session, &key.alias),
        )
        .await
    }

    async fn usage(&self, served: &[Key], hosts: &[Host], live_stats: bool) -> UsageSummary {
        let expire = served
            .iter()
            .map(|key| key.expires_at.timestamp())
            .min()
            .unwrap_or(0);

        if served.is_empty() {
            return UsageSummary::default();
        }

        if !live_stats {
            return UsageSummary {
                upload: 0,
                download: 0,
                total: UNLIMITED_BYTES,
                expire,
            };
        }

        let mut counters = Vec::new();
        for key in served {
            let Some(host) = hosts.iter().find(|h| h.host_name == key.host_name) else {
                continue;
            };
            if let Some(traffic) = self.traffic(host, key).await {
                counters.push(traffic);
            }
        }

        let upload = counters.iter().map(|c| c.up).sum();
        let download = counters.iter().map(|c| c.down).sum();
        let total = if counters.is_empty() || counters.iter().any(TrafficCounters::is_unlimited) {
            UNLIMITED_BYTES
        } else {
            counters.iter().map(|c| c.total).sum()
        };

        UsageSummary {
            upload,
            download,
            total,
            expire,
        }
    }

    /// Live counters for one key, or `None` if the panel did not answer in time.
    async fn traffic(&self, host: &Host, key: &Key) -> Option<TrafficCounters> {
        match bounded(self.traffic_timeout, self.live_traffic(host, key)).await {
            Ok(counters) => counters,
            Err(e) => {
                tracing::debug!(host = %host.host_name, error = %e, "Traffic stats unavailable");
                None
            }
        }
    }

    async fn live_traffic(&self, host: &Host, key: &Key) -> Result<Option<TrafficCounters>, PanelError> {
        let panel = self.provisioner.panel();
        let session = panel.login(host).await?;
        panel.client_traffic(&session, &key.alias).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        models::{host::GLOBAL_HOST, key::NewKey},
        panel::{InMemoryPanel, RemoteClient},
        store::InMemoryStore,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn host(name: &str, enabled: bool) -> Host {
        Host {
            host_name: name.to_string(),
            host_url: format!("https://{name}.panel.example:2053"),
            host_username: "admin".to_string(),
            host_password: "secret".to_string(),
            inbound_id: 1,
            is_enabled: enabled,
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        panel: Arc<InMemoryPanel>,
        service: SubscriptionService,
        token: String,
    }

    async fn fixture(hosts: &[(&str, bool)]) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(InMemoryPanel::new(now()));
        for (name, enabled) in hosts {
            store.upsert_host(&host(name, *enabled)).await.unwrap();
        }
        let user = store.register_user(7, Some("alice"), None).await.unwrap();
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            panel.clone(),
            std::time::Duration::from_millis(200),
        ));
        let service = SubscriptionService::new(
            store.clone(),
            provisioner,
            std::time::Duration::from_millis(200),
        );
        Fixture {
            store,
            panel,
            service,
            token: user.subscription_token,
        }
    }

    async fn add_key(
        store: &InMemoryStore,
        alias: &str,
        host_name: &str,
        expires_at: DateTime<Utc>,
        plan_id: i64,
    ) -> Key {
        store
            .upsert_key(&NewKey {
                user_id: 7,
                host_name: host_name.to_string(),
                client_id: format!("id-{alias}"),
                alias: alias.to_string(),
                expires_at,
                connection_descriptor: Some(format!("vless://{alias}")),
                plan_id,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_token_has_no_feed() {
        let f = fixture(&[("nl", true)]).await;
        assert!(f.service.build_feed("nope", now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_without_keys_gets_an_empty_feed() {
        let f = fixture(&[("nl", true)]).await;
        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert!(feed.descriptors.is_empty());
        assert_eq!(feed.usage, UsageSummary::default());
        assert_eq!(feed.title, "Subscription");
    }

    #[tokio::test]
    async fn new_host_gets_only_the_remaining_global_time() {
        let f = fixture(&[("de", true), ("nl", true), ("fi", true)]).await;
        let global = f.store.create_plan(GLOBAL_HOST, "Global", 1, 500).await.unwrap();
        let t1 = now() + Duration::days(3);
        let t2 = now() + Duration::days(20);
        add_key(&f.store, "user7-key1-de", "de", t1, global.plan_id).await;
        add_key(&f.store, "user7-key1-nl", "nl", t2, global.plan_id).await;

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors.len(), 3);
        let remote = f.panel.client("fi", "user7-global-fi").unwrap();
        assert_eq!(remote.expiry_ms, t1.timestamp_millis());
        let keys = f.store.keys_for_user(7).await.unwrap();
        let added = keys.iter().find(|k| k.host_name == "fi").unwrap();
        assert_eq!(added.expires_at, t1);
        assert_eq!(added.plan_id, global.plan_id);
        assert_eq!(feed.usage.expire, t1.timestamp());
    }

    #[tokio::test]
    async fn second_request_does_not_extend_the_new_host_again() {
        let f = fixture(&[("de", true), ("fi", true)]).await;
        let global = f.store.create_plan(GLOBAL_HOST, "Global", 1, 500).await.unwrap();
        let t1 = now() + Duration::days(3);
        add_key(&f.store, "user7-key1-de", "de", t1, global.plan_id).await;

        f.service.build_feed(&f.token, now()).await.unwrap();
        f.service.build_feed(&f.token, now()).await.unwrap();

        let remote = f.panel.client("fi", "user7-global-fi").unwrap();
        assert_eq!(remote.expiry_ms, t1.timestamp_millis());
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_stack_time_on_the_new_host() {
        let f = fixture(&[("de", true), ("fi", true)]).await;
        let global = f.store.create_plan(GLOBAL_HOST, "Global", 1, 500).await.unwrap();
        let t1 = now() + Duration::days(3);
        add_key(&f.store, "user7-key1-de", "de", t1, global.plan_id).await;
        // Both requests read the keys before either writes the new one
        f.panel.set_latency("fi", Some(std::time::Duration::from_millis(20)));

        let (first, second) = tokio::join!(
            f.service.build_feed(&f.token, now()),
            f.service.build_feed(&f.token, now()),
        );
        assert_eq!(first.unwrap().unwrap().descriptors.len(), 2);
        assert_eq!(second.unwrap().unwrap().descriptors.len(), 2);

        let remote = f.panel.client("fi", "user7-global-fi").unwrap();
        assert_eq!(remote.expiry_ms, t1.timestamp_millis());
        let added = f.store.keys_for_host("fi").await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].expires_at, t1);
    }

    #[tokio::test]
    async fn unreachable_host_is_skipped_without_failing_the_feed() {
        let f = fixture(&[("de", true), ("fi", true), ("se", true)]).await;
        let global = f.store.create_plan(GLOBAL_HOST, "Global", 1, 500).await.unwrap();
        add_key(&f.store, "user7-key1-de", "de", now() + Duration::days(3), global.plan_id).await;
        f.panel.set_unreachable("fi", true);
        f.panel.set_hanging("se", true);

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors, vec!["vless://user7-key1-de".to_string()]);
    }

    #[tokio::test]
    async fn individual_keys_do_not_trigger_provisioning() {
        let f = fixture(&[("de", true), ("fi", true)]).await;
        f.store.create_plan("de", "Monthly", 1, 300).await.unwrap();
        add_key(&f.store, "user7-key1-de", "de", now() + Duration::days(3), 1).await;

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors.len(), 1);
        assert!(f.panel.clients("fi").is_empty());
    }

    #[tokio::test]
    async fn untagged_keys_on_two_hosts_count_as_global() {
        let f = fixture(&[("de", true), ("nl", true), ("fi", true)]).await;
        let global = f.store.create_plan(GLOBAL_HOST, "Global", 1, 500).await.unwrap();
        let individual = f.store.create_plan("de", "Monthly", 1, 300).await.unwrap();
        add_key(&f.store, "user7-key1-de", "de", now() + Duration::days(2), individual.plan_id).await;
        add_key(&f.store, "user7-key2-nl", "nl", now() + Duration::days(9), individual.plan_id).await;

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors.len(), 3);
        let added = f.store.keys_for_host("fi").await.unwrap();
        assert_eq!(added[0].plan_id, global.plan_id);
        assert_eq!(added[0].expires_at, now() + Duration::days(2));
    }

    #[tokio::test]
    async fn duplicate_keys_for_one_host_serve_the_latest() {
        let f = fixture(&[("nl", true)]).await;
        add_key(&f.store, "user7-key1-nl", "nl", now() + Duration::days(2), 4).await;
        add_key(&f.store, "user7-key2-nl", "nl", now() + Duration::days(9), 4).await;

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors, vec!["vless://user7-key2-nl".to_string()]);
        assert_eq!(feed.usage.expire, (now() + Duration::days(9)).timestamp());
    }

    #[tokio::test]
    async fn tombstoned_disabled_expired_and_trial_keys_are_hidden() {
        let f = fixture(&[("nl", true), ("de", false), ("fi", true), ("se", true), ("pl", true)]).await;
        add_key(&f.store, "user7-key1-nl", "nl", now() + Duration::days(2), 4).await;
        add_key(&f.store, "user7-key2-de", "de", now() + Duration::days(2), 4).await;
        add_key(&f.store, "user7-key3-fi", "fi", now() + Duration::days(2), 4).await;
        add_key(&f.store, "user7-key4-se", "se", now() - Duration::hours(1), 4).await;
        add_key(&f.store, "user7-trial-pl", "pl", now() + Duration::days(2), 0).await;
        f.store.mark_key_missing("user7-key3-fi", "fi", now()).await.unwrap();

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors, vec!["vless://user7-key1-nl".to_string()]);
    }

    #[tokio::test]
    async fn missing_descriptors_are_regenerated_and_cached_when_enabled() {
        let f = fixture(&[("nl", true)]).await;
        f.store
            .set_setting(settings::SUBSCRIPTION_REGENERATE_DESCRIPTORS, "true")
            .await
            .unwrap();
        let key = f
            .store
            .upsert_key(&NewKey {
                user_id: 7,
                host_name: "nl".to_string(),
                client_id: "client-9".to_string(),
                alias: "user7-key1-nl".to_string(),
                expires_at: now() + Duration::days(2),
                connection_descriptor: None,
                plan_id: 4,
            })
            .await
            .unwrap();
        f.panel.insert_client(
            "nl",
            RemoteClient {
                client_id: "client-9".to_string(),
                alias: "user7-key1-nl".to_string(),
                expiry_ms: key.expiry_ms(),
                enabled: true,
                flow: None,
            },
        );

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.descriptors.len(), 1);
        assert!(feed.descriptors[0].contains("client-9"));
        let cached = f.store.key(key.key_id).await.unwrap().unwrap();
        assert_eq!(cached.connection_descriptor.as_deref(), Some(feed.descriptors[0].as_str()));
    }

    #[tokio::test]
    async fn missing_descriptors_are_skipped_by_default() {
        let f = fixture(&[("nl", true)]).await;
        f.store
            .upsert_key(&NewKey {
                user_id: 7,
                host_name: "nl".to_string(),
                client_id: "client-9".to_string(),
                alias: "user7-key1-nl".to_string(),
                expires_at: now() + Duration::days(2),
                connection_descriptor: None,
                plan_id: 4,
            })
            .await
            .unwrap();

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert!(feed.descriptors.is_empty());
        assert_eq!(feed.usage.total, 0);
    }

    #[tokio::test]
    async fn one_unlimited_counter_makes_the_total_unlimited() {
        let f = fixture(&[("de", true), ("nl", true)]).await;
        f.store
            .set_setting(settings::SUBSCRIPTION_LIVE_STATS, "on")
            .await
            .unwrap();
        add_key(&f.store, "user7-key1-de", "de", now() + Duration::days(2), 4).await;
        add_key(&f.store, "user7-key2-nl", "nl", now() + Duration::days(2), 4).await;
        f.panel.set_traffic("de", "user7-key1-de", TrafficCounters { up: 10, down: 20, total: 1_000 });
        f.panel.set_traffic("nl", "user7-key2-nl", TrafficCounters { up: 1, down: 2, total: 0 });

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.usage.upload, 11);
        assert_eq!(feed.usage.download, 22);
        assert_eq!(feed.usage.total, UNLIMITED_BYTES);
    }

    #[tokio::test]
    async fn limited_counters_are_summed() {
        let f = fixture(&[("de", true), ("nl", true)]).await;
        f.store
            .set_setting(settings::SUBSCRIPTION_LIVE_STATS, "true")
            .await
            .unwrap();
        add_key(&f.store, "user7-key1-de", "de", now() + Duration::days(2), 4).await;
        add_key(&f.store, "user7-key2-nl", "nl", now() + Duration::days(2), 4).await;
        f.panel.set_traffic("de", "user7-key1-de", TrafficCounters { up: 10, down: 20, total: 1_000 });
        f.panel.set_traffic("nl", "user7-key2-nl", TrafficCounters { up: 1, down: 2, total: 500 });

        let feed = f.service.build_feed(&f.token, now()).await.unwrap().unwrap();

        assert_eq!(feed.usage.total, 1_500);
    }

    #[test]
    fn body_is_base64_of_newline_joined_descriptors() {
        let feed = SubscriptionFeed {
            title: "VPN".to_string(),
            update_interval_hours: 12,
            descriptors: vec!["a".to_string(), "b".to_string()],
            usage: UsageSummary {
                upload: 1,
                download: 2,
                total: 3,
                expire: 4,
            },
        };
        assert_eq!(feed.encoded_body(), STANDARD.encode("a\nb"));
        assert_eq!(feed.userinfo_header(), "upload=1; download=2; total=3; expire=4");
    }
}
