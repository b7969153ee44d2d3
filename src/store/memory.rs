//! In-memory entitlement store for tests and local development.
//!
//! Mirrors the Postgres semantics: conditional updates are atomic under one
//! lock, inserts that would violate a unique constraint are reported the same
//! way, and deleting a key drops its tombstone.
//!
//! Individual operations, or every key write on one alias, can be made to
//! fail with [`StoreError::Unavailable`] to drive the error paths of the
//! services built on top.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{EntitlementStore, StoreError, StoreResult};
use crate::models::{
    host::{GLOBAL_HOST, Host},
    key::{Key, NewKey},
    notification::{NotificationKind, SentNotification},
    plan::Plan,
    transaction::{NewTransaction, Transaction},
    user::{User, generate_subscription_token},
};

#[derive(Default)]
struct Inner {
    users: BTreeMap<i64, User>,
    hosts: BTreeMap<String, Host>,
    plans: BTreeMap<i64, Plan>,
    next_plan_id: i64,
    keys: BTreeMap<i64, Key>,
    next_key_id: i64,
    /// alias -> (host, first seen)
    missing: HashMap<String, (String, DateTime<Utc>)>,
    notifications: Vec<SentNotification>,
    webhooks: HashMap<(String, String), DateTime<Utc>>,
    transactions: Vec<Transaction>,
    settings: HashMap<String, String>,
    failing_operations: HashSet<String>,
    failing_aliases: HashSet<String>,
}

impl Inner {
    fn with_marker(&self, key: &Key) -> Key {
        let mut key = key.clone();
        key.missing_since = self.missing.get(&key.alias).map(|(_, since)| *since);
        key
    }

    fn keys_where(&self, predicate: impl Fn(&Key) -> bool) -> Vec<Key> {
        self.keys
            .values()
            .filter(|key| predicate(key))
            .map(|key| self.with_marker(key))
            .collect()
    }

    fn key_id_by_alias(&self, alias: &str) -> Option<i64> {
        self.keys
            .values()
            .find(|key| key.alias == alias)
            .map(|key| key.key_id)
    }
}

/// Entitlement store kept in process memory. Cloning shares the data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` (a trait method name) fail until switched back.
    pub fn fail_on(&self, operation: &str, failing: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing {
            inner.failing_operations.insert(operation.to_string());
        } else {
            inner.failing_operations.remove(operation);
        }
    }

    /// Make every key write on `alias` fail until switched back.
    pub fn fail_alias(&self, alias: &str, failing: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing {
            inner.failing_aliases.insert(alias.to_string());
        } else {
            inner.failing_aliases.remove(alias);
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    fn guard(&self, operation: &str) -> StoreResult<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        if inner.failing_operations.contains(operation) {
            return Err(StoreError::Unavailable(format!("{operation} is failing")));
        }
        Ok(inner)
    }

    fn guard_alias(&self, operation: &str, alias: &str) -> StoreResult<MutexGuard<'_, Inner>> {
        let inner = self.guard(operation)?;
        if inner.failing_aliases.contains(alias) {
            return Err(StoreError::Unavailable(format!("{operation} on {alias} is failing")));
        }
        Ok(inner)
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn register_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        referred_by: Option<i64>,
    ) -> StoreResult<User> {
        let mut inner = self.guard("register_user")?;
        let referred_by = referred_by
            .filter(|referrer| *referrer != user_id)
            .filter(|referrer| inner.users.contains_key(referrer));

        let user = inner.users.entry(user_id).or_insert_with(|| User {
            user_id,
            username: username.map(str::to_string),
            is_banned: false,
            total_spent_cents: 0,
            total_months: 0,
            referred_by,
            referral_balance_cents: 0,
            subscription_token: generate_subscription_token(),
            pending_payment: false,
            registered_at: Utc::now(),
        });

        Ok(user.clone())
    }

    async fn user(&self, user_id: i64) -> StoreResult<Option<User>> {
        Ok(self.guard("user")?.users.get(&user_id).cloned())
    }

    async fn user_by_token(&self, token: &str) -> StoreResult<Option<User>> {
        Ok(self
            .guard("user_by_token")?
            .users
            .values()
            .find(|user| user.subscription_token == token)
            .cloned())
    }

    async fn try_begin_payment(&self, user_id: i64) -> StoreResult<bool> {
        let mut inner = self.guard("try_begin_payment")?;
        match inner.users.get_mut(&user_id) {
            Some(user) if !user.pending_payment => {
                user.pending_payment = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_payment(&self, user_id: i64) -> StoreResult<()> {
        if let Some(user) = self.guard("finish_payment")?.users.get_mut(&user_id) {
            user.pending_payment = false;
        }
        Ok(())
    }

    async fn clear_all_pending_payments(&self) -> StoreResult<u64> {
        let mut inner = self.guard("clear_all_pending_payments")?;
        let mut cleared = 0;
        for user in inner.users.values_mut().filter(|user| user.pending_payment) {
            user.pending_payment = false;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn record_purchase(
        &self,
        user_id: i64,
        amount_cents: i64,
        months: i32,
    ) -> StoreResult<()> {
        if let Some(user) = self.guard("record_purchase")?.users.get_mut(&user_id) {
            user.total_spent_cents += amount_cents;
            user.total_months += months;
        }
        Ok(())
    }

    async fn add_referral_balance(&self, user_id: i64, amount_cents: i64) -> StoreResult<()> {
        if let Some(user) = self.guard("add_referral_balance")?.users.get_mut(&user_id) {
            user.referral_balance_cents += amount_cents;
        }
        Ok(())
    }

    async fn hosts(&self, only_enabled: bool) -> StoreResult<Vec<Host>> {
        Ok(self
            .guard("hosts")?
            .hosts
            .values()
            .filter(|host| host.is_enabled || !only_enabled)
            .cloned()
            .collect())
    }

    async fn host(&self, host_name: &str) -> StoreResult<Option<Host>> {
        Ok(self.guard("host")?.hosts.get(host_name).cloned())
    }

    async fn upsert_host(&self, host: &Host) -> StoreResult<()> {
        if host.host_name == GLOBAL_HOST {
            return Err(StoreError::Constraint(format!(
                "host name {GLOBAL_HOST} is reserved"
            )));
        }
        self.guard("upsert_host")?
            .hosts
            .insert(host.host_name.clone(), host.clone());
        Ok(())
    }

    async fn set_host_enabled(&self, host_name: &str, enabled: bool) -> StoreResult<()> {
        if let Some(host) = self.guard("set_host_enabled")?.hosts.get_mut(host_name) {
            host.is_enabled = enabled;
        }
        Ok(())
    }

    async fn plan(&self, plan_id: i64) -> StoreResult<Option<Plan>> {
        Ok(self.guard("plan")?.plans.get(&plan_id).cloned())
    }

    async fn global_plan_ids(&self) -> StoreResult<BTreeSet<i64>> {
        Ok(self
            .guard("global_plan_ids")?
            .plans
            .values()
            .filter(|plan| plan.is_global())
            .map(|plan| plan.plan_id)
            .collect())
    }

    async fn create_plan(
        &self,
        host_name: &str,
        plan_name: &str,
        months: i32,
        price_cents: i64,
    ) -> StoreResult<Plan> {
        if months <= 0 || price_cents < 0 {
            return Err(StoreError::Constraint(
                "plans need a positive duration and a non-negative price".to_string(),
            ));
        }
        let mut inner = self.guard("create_plan")?;
        inner.next_plan_id += 1;
        let plan = Plan {
            plan_id: inner.next_plan_id,
            host_name: host_name.to_string(),
            plan_name: plan_name.to_string(),
            months,
            price_cents,
        };
        inner.plans.insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn keys_for_host(&self, host_name: &str) -> StoreResult<Vec<Key>> {
        Ok(self.guard("keys_for_host")?.keys_where(|key| key.host_name == host_name))
    }

    async fn keys_for_user(&self, user_id: i64) -> StoreResult<Vec<Key>> {
        Ok(self.guard("keys_for_user")?.keys_where(|key| key.user_id == user_id))
    }

    async fn all_keys(&self) -> StoreResult<Vec<Key>> {
        Ok(self.guard("all_keys")?.keys_where(|_| true))
    }

    async fn key(&self, key_id: i64) -> StoreResult<Option<Key>> {
        let inner = self.guard("key")?;
        Ok(inner.keys.get(&key_id).map(|key| inner.with_marker(key)))
    }

    async fn upsert_key(&self, new_key: &NewKey) -> StoreResult<Key> {
        let mut inner = self.guard_alias("upsert_key", &new_key.alias)?;
        if !inner.users.contains_key(&new_key.user_id) {
            return Err(StoreError::Constraint(format!(
                "user {} does not exist",
                new_key.user_id
            )));
        }

        let key_id = match inner.key_id_by_alias(&new_key.alias) {
            Some(key_id) => {
                let key = inner.keys.get_mut(&key_id).ok_or(StoreError::NotFound("key"))?;
                key.client_id = new_key.client_id.clone();
                key.expires_at = key.expires_at.max(new_key.expires_at);
                if new_key.connection_descriptor.is_some() {
                    key.connection_descriptor = new_key.connection_descriptor.clone();
                }
                key.plan_id = new_key.plan_id;
                key_id
            }
            None => {
                inner.next_key_id += 1;
                let key_id = inner.next_key_id;
                inner.keys.insert(
                    key_id,
                    Key {
                        key_id,
                        user_id: new_key.user_id,
                        host_name: new_key.host_name.clone(),
                        client_id: new_key.client_id.clone(),
                        alias: new_key.alias.clone(),
                        expires_at: new_key.expires_at,
                        connection_descriptor: new_key.connection_descriptor.clone(),
                        plan_id: new_key.plan_id,
                        created_at: Utc::now(),
                        missing_since: None,
                    },
                );
                key_id
            }
        };

        inner.missing.remove(&new_key.alias);
        let key = inner.keys.get(&key_id).ok_or(StoreError::NotFound("key"))?;
        Ok(inner.with_marker(key))
    }

    async fn sync_key_from_remote(
        &self,
        alias: &str,
        client_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.guard_alias("sync_key_from_remote", alias)?;
        if let Some(key_id) = inner.key_id_by_alias(alias) {
            if let Some(key) = inner.keys.get_mut(&key_id) {
                key.client_id = client_id.to_string();
                key.expires_at = expires_at;
            }
        }
        inner.missing.remove(alias);
        Ok(())
    }

    async fn set_key_descriptor(&self, key_id: i64, descriptor: &str) -> StoreResult<()> {
        if let Some(key) = self.guard("set_key_descriptor")?.keys.get_mut(&key_id) {
            key.connection_descriptor = Some(descriptor.to_string());
        }
        Ok(())
    }

    async fn delete_key(&self, alias: &str) -> StoreResult<bool> {
        let mut inner = self.guard_alias("delete_key", alias)?;
        inner.missing.remove(alias);
        match inner.key_id_by_alias(alias) {
            Some(key_id) => Ok(inner.keys.remove(&key_id).is_some()),
            None => Ok(false),
        }
    }

    async fn mark_key_missing(
        &self,
        alias: &str,
        host_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.guard_alias("mark_key_missing", alias)?;
        if inner.key_id_by_alias(alias).is_none() {
            return Err(StoreError::Constraint(format!(
                "cannot tombstone unknown alias {alias}"
            )));
        }
        if inner.missing.contains_key(alias) {
            return Ok(false);
        }
        inner
            .missing
            .insert(alias.to_string(), (host_name.to_string(), seen_at));
        Ok(true)
    }

    async fn clear_missing_marker(&self, alias: &str) -> StoreResult<bool> {
        Ok(self.guard_alias("clear_missing_marker", alias)?.missing.remove(alias).is_some())
    }

    async fn sent_thresholds(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
    ) -> StoreResult<Vec<i32>> {
        Ok(self
            .guard("sent_thresholds")?
            .notifications
            .iter()
            .filter(|row| row.user_id == user_id && row.key_id == key_id && row.kind == kind.as_str())
            .map(|row| row.threshold_hours)
            .collect())
    }

    async fn record_notification(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
        threshold_hours: i32,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.guard("record_notification")?;
        let exists = inner.notifications.iter().any(|row| {
            row.user_id == user_id
                && row.key_id == key_id
                && row.kind == kind.as_str()
                && row.threshold_hours == threshold_hours
        });
        if exists {
            return Ok(false);
        }
        inner.notifications.push(SentNotification {
            user_id,
            key_id,
            kind: kind.as_str().to_string(),
            threshold_hours,
            sent_at,
        });
        Ok(true)
    }

    async fn forget_notifications(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
    ) -> StoreResult<u64> {
        let mut inner = self.guard("forget_notifications")?;
        let before = inner.notifications.len();
        inner.notifications.retain(|row| {
            !(row.user_id == user_id && row.key_id == key_id && row.kind == kind.as_str())
        });
        Ok((before - inner.notifications.len()) as u64)
    }

    async fn prune_notifications(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.guard("prune_notifications")?;
        let before = inner.notifications.len();
        inner.notifications.retain(|row| row.sent_at >= older_than);
        Ok((before - inner.notifications.len()) as u64)
    }

    async fn is_webhook_processed(&self, provider: &str, external_id: &str) -> StoreResult<bool> {
        Ok(self
            .guard("is_webhook_processed")?
            .webhooks
            .contains_key(&(provider.to_string(), external_id.to_string())))
    }

    async fn mark_webhook_processed(
        &self,
        provider: &str,
        external_id: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.guard("mark_webhook_processed")?;
        let id = (provider.to_string(), external_id.to_string());
        if inner.webhooks.contains_key(&id) {
            return Ok(false);
        }
        inner.webhooks.insert(id, processed_at);
        Ok(true)
    }

    async fn release_webhook(&self, provider: &str, external_id: &str) -> StoreResult<()> {
        self.guard("release_webhook")?
            .webhooks
            .remove(&(provider.to_string(), external_id.to_string()));
        Ok(())
    }

    async fn log_transaction(&self, transaction: &NewTransaction) -> StoreResult<Transaction> {
        let logged = Transaction {
            transaction_id: Uuid::new_v4(),
            user_id: transaction.user_id,
            status: transaction.status.to_string(),
            amount_cents: transaction.amount_cents,
            payment_method: transaction.payment_method.clone(),
            provider: transaction.provider.clone(),
            external_id: transaction.external_id.clone(),
            plan_id: transaction.plan_id,
            host_name: transaction.host_name.clone(),
            metadata: transaction.metadata.clone(),
            created_at: Utc::now(),
        };
        self.guard("log_transaction")?.transactions.push(logged.clone());
        Ok(logged)
    }

    async fn transactions_for_user(&self, user_id: i64) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .guard("transactions_for_user")?
            .transactions
            .iter()
            .rev()
            .filter(|transaction| transaction.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.guard("setting")?.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.guard("set_setting")?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn new_key(user_id: i64, alias: &str, expires_at: DateTime<Utc>) -> NewKey {
        NewKey {
            user_id,
            host_name: "nl".to_string(),
            client_id: "client-1".to_string(),
            alias: alias.to_string(),
            expires_at,
            connection_descriptor: Some("vless://a@nl:443#a".to_string()),
            plan_id: 1,
        }
    }

    #[tokio::test]
    async fn pending_payment_is_compare_and_set() {
        let store = InMemoryStore::new();
        store.register_user(7, None, None).await.unwrap();

        assert!(store.try_begin_payment(7).await.unwrap());
        assert!(!store.try_begin_payment(7).await.unwrap());

        store.finish_payment(7).await.unwrap();
        assert!(store.try_begin_payment(7).await.unwrap());
        assert_eq!(store.clear_all_pending_payments().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_never_moves_expiry_backwards_and_clears_tombstone() {
        let store = InMemoryStore::new();
        store.register_user(7, None, None).await.unwrap();
        let now = Utc::now();

        store
            .upsert_key(&new_key(7, "user7-key1-nl", now + Duration::days(30)))
            .await
            .unwrap();
        store.mark_key_missing("user7-key1-nl", "nl", now).await.unwrap();

        let mut shorter = new_key(7, "user7-key1-nl", now + Duration::days(1));
        shorter.connection_descriptor = None;
        let key = store.upsert_key(&shorter).await.unwrap();

        assert_eq!(key.expires_at, now + Duration::days(30));
        assert!(key.connection_descriptor.is_some());
        assert!(!key.is_tombstoned());
    }

    #[tokio::test]
    async fn tombstones_keep_first_seen_and_die_with_the_key() {
        let store = InMemoryStore::new();
        store.register_user(7, None, None).await.unwrap();
        let now = Utc::now();
        store
            .upsert_key(&new_key(7, "user7-key1-nl", now))
            .await
            .unwrap();

        assert!(store.mark_key_missing("user7-key1-nl", "nl", now).await.unwrap());
        assert!(
            !store
                .mark_key_missing("user7-key1-nl", "nl", now + Duration::hours(1))
                .await
                .unwrap()
        );
        let key = store.all_keys().await.unwrap().remove(0);
        assert_eq!(key.missing_since, Some(now));

        assert!(store.delete_key("user7-key1-nl").await.unwrap());
        assert!(!store.clear_missing_marker("user7-key1-nl").await.unwrap());
    }

    #[tokio::test]
    async fn ledgers_reject_duplicates() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        assert!(store.mark_webhook_processed("cryptobot", "1", now).await.unwrap());
        assert!(!store.mark_webhook_processed("cryptobot", "1", now).await.unwrap());
        assert!(store.mark_webhook_processed("heleket", "1", now).await.unwrap());

        let kind = NotificationKind::Expiry;
        assert!(store.record_notification(7, Some(1), kind, 24, now).await.unwrap());
        assert!(!store.record_notification(7, Some(1), kind, 24, now).await.unwrap());
        assert!(
            store
                .record_notification(7, None, NotificationKind::GlobalExpiry, 24, now)
                .await
                .unwrap()
        );
        assert_eq!(store.sent_thresholds(7, Some(1), kind).await.unwrap(), vec![24]);

        let pruned = store
            .prune_notifications(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
    }

    #[tokio::test]
    async fn switched_off_operations_fail_until_restored() {
        let store = InMemoryStore::new();
        store.register_user(7, None, None).await.unwrap();
        let now = Utc::now();
        store.upsert_key(&new_key(7, "user7-key1-nl", now)).await.unwrap();
        store.upsert_key(&new_key(7, "user7-key2-nl", now)).await.unwrap();

        store.fail_on("user", true);
        assert!(matches!(store.user(7).await, Err(StoreError::Unavailable(_))));
        store.fail_on("user", false);
        assert!(store.user(7).await.unwrap().is_some());

        store.fail_alias("user7-key1-nl", true);
        assert!(store.mark_key_missing("user7-key1-nl", "nl", now).await.is_err());
        assert!(store.mark_key_missing("user7-key2-nl", "nl", now).await.unwrap());
        assert_eq!(store.keys_for_user(7).await.unwrap().len(), 2);
    }
}
