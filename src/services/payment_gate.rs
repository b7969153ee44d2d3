//! Payment completion gate.
//!
//! Every provider adapter hands its verified, normalised callback to
//! [`PaymentGate::process`]. The gate absorbs duplicate deliveries through the
//! processed-webhook ledger, serialises completions per user through the
//! `pending_payment` compare-and-set, and only then provisions keys.
//!
//! Per user the flag moves `IDLE -> PENDING -> IDLE`. The clear runs on a
//! task of its own, so neither a panic during provisioning nor a dropped
//! request can leave the user locked out of future purchases.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::{
    config::settings,
    models::{
        host::Host,
        key::Key,
        plan::Plan,
        transaction::{NewTransaction, STATUS_FAILED, STATUS_PAID},
        webhook::{PaymentAction, PaymentCallback},
    },
    panel::ClientExpiry,
    store::{EntitlementStore, StoreError},
};

use super::{
    notifier::rearm,
    provisioning::{ProvisionRequest, Provisioner, next_key_number, purchase_alias},
};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The decoded payment is malformed
    #[error("Invalid payment: {0}")]
    Invalid(String),

    #[error("User {0} not found")]
    UnknownUser(i64),
}

/// What a successful completion changed.
#[derive(Debug, Clone)]
pub struct PurchaseSummary {
    pub user_id: i64,
    pub plan_id: i64,
    pub amount_cents: i64,
    /// Keys created or extended
    pub keys: Vec<Key>,
    /// Hosts the purchase targeted but could not be provisioned
    pub failed_hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// The callback id was already processed
    Duplicate,
    /// Another completion holds the user; the provider should retry
    Busy,
    Completed(PurchaseSummary),
    /// Processed, but nothing could be granted. A `failed` transaction was logged.
    Failed(String),
}

/// One host to write and how to tag the resulting key.
#[derive(Debug, Clone)]
struct Target {
    host: Host,
    alias: String,
    plan_tag: i64,
}

/// Result of resolving a payment before any panel is touched.
enum Prepared {
    Ready(Plan, Vec<Target>),
    /// Booked as a failed transaction
    Rejected(Option<Plan>, String),
}

/// Idempotency and serialisation in front of entitlement mutation.
#[derive(Clone)]
pub struct PaymentGate {
    store: Arc<dyn EntitlementStore>,
    provisioner: Arc<Provisioner>,
}

impl PaymentGate {
    /// # Arguments
    ///
    /// * `store` - holds the webhook ledger, the `pending_payment` flags and
    ///   the transaction log
    /// * `provisioner` - creates or extends keys on the target hosts
    pub fn new(store: Arc<dyn EntitlementStore>, provisioner: Arc<Provisioner>) -> Self {
        Self { store, provisioner }
    }

    /// Clear `pending_payment` flags left by an unclean shutdown.
    pub async fn reset_pending(&self) -> Result<u64, StoreError> {
        let cleared = self.store.clear_all_pending_payments().await?;
        if cleared > 0 {
            tracing::warn!(cleared, "Cleared pending payment flags left from a previous run");
        }
        Ok(cleared)
    }

    /// Apply one payment callback at most once.
    ///
    /// # Errors
    ///
    /// - `Invalid`: the payment failed validation
    /// - `UnknownUser`: no such user; the ledger row is released so a retry
    ///   after registration goes through
    /// - `Store`: the store failed before anything was granted, in which case
    ///   the callback id is released, or keys were granted but the
    ///   transaction could not be logged
    pub async fn process(
        &self,
        callback: PaymentCallback,
        now: DateTime<Utc>,
    ) -> Result<GateOutcome, GateError> {
        let provider = callback.provider;
        let external_id = callback.external_id.as_str().to_string();

        if self.store.is_webhook_processed(provider, &external_id).await? {
            tracing::info!(provider, external_id = %external_id, "Duplicate payment callback ignored");
            return Ok(GateOutcome::Duplicate);
        }

        // A provider-issued id is recorded before anything else. A payload
        // digest is only recorded once the payload is known to be well formed.
        if callback.external_id.is_trusted() {
            if !self.mark(provider, &external_id, now).await? {
                return Ok(GateOutcome::Duplicate);
            }
            callback.payment.validate().map_err(GateError::Invalid)?;
        } else {
            callback.payment.validate().map_err(GateError::Invalid)?;
            if !self.mark(provider, &external_id, now).await? {
                return Ok(GateOutcome::Duplicate);
            }
        }

        let user_id = callback.payment.user_id;
        match self.store.user(user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.release(provider, &external_id).await;
                return Err(GateError::UnknownUser(user_id));
            }
            Err(e) => {
                self.release(provider, &external_id).await;
                return Err(e.into());
            }
        }

        let locked = match self.store.try_begin_payment(user_id).await {
            Ok(locked) => locked,
            Err(e) => {
                self.release(provider, &external_id).await;
                return Err(e.into());
            }
        };
        if !locked {
            tracing::warn!(
                user_id,
                provider,
                external_id = %external_id,
                "Payment already in progress for user, callback rejected"
            );
            self.release(provider, &external_id).await;
            return Ok(GateOutcome::Busy);
        }

        let gate = self.clone();
        let task = tokio::spawn(async move {
            let worker = gate.clone();
            let fulfilled = tokio::spawn(async move { worker.fulfil(&callback, now).await }).await;

            if let Err(e) = gate.store.finish_payment(user_id).await {
                tracing::error!(user_id, error = %e, "Failed to clear pending payment flag");
            }
            fulfilled
        });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) | Err(join_error) => {
                tracing::error!(
                    user_id,
                    provider,
                    external_id = %external_id,
                    error = %join_error,
                    "Payment fulfilment aborted"
                );
                Ok(GateOutcome::Failed("fulfilment aborted".to_string()))
            }
        }
    }

    /// Forget a recorded callback id so the provider's retry is processed.
    ///
    /// Only used while nothing has been granted for the callback yet.
    async fn release(&self, provider: &str, external_id: &str) {
        if let Err(e) = self.store.release_webhook(provider, external_id).await {
            tracing::error!(
                provider,
                external_id,
                error = %e,
                "Could not release payment callback, provider retries will read as duplicates"
            );
        }
    }

    async fn mark(&self, provider: &str, external_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let inserted = self
            .store
            .mark_webhook_processed(provider, external_id, now)
            .await?;
        if !inserted {
            tracing::info!(provider, external_id, "Concurrent duplicate payment callback ignored");
        }
        Ok(inserted)
    }

    /// Resolve targets, provision them and book the purchase.
    ///
    /// A store failure before anything was provisioned releases the callback
    /// id and is returned, so the provider's retry starts over. Once a key has
    /// been written the callback stays recorded: the remaining bookkeeping is
    /// best effort and the purchase is always logged.
    async fn fulfil(&self, callback: &PaymentCallback, now: DateTime<Utc>) -> Result<GateOutcome, GateError> {
        let (plan, targets) = match self.prepare(callback).await {
            Ok(Prepared::Ready(plan, targets)) => (plan, targets),
            Ok(Prepared::Rejected(plan, reason)) => {
                return self.fail(callback, plan.as_ref(), reason).await;
            }
            Err(e) => {
                tracing::error!(
                    user_id = callback.payment.user_id,
                    provider = callback.provider,
                    error = %e,
                    "Store failed before provisioning, callback released for retry"
                );
                self.release(callback.provider, callback.external_id.as_str()).await;
                return Err(e.into());
            }
        };

        let payment = &callback.payment;
        let mut keys = Vec::new();
        let mut failed_hosts = Vec::new();

        for target in targets {
            let request = ProvisionRequest {
                user_id: payment.user_id,
                alias: target.alias,
                expiry: ClientExpiry::Extend(plan.duration()),
                plan_id: target.plan_tag,
            };
            match self.provisioner.provision(&target.host, &request).await {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::error!(
                        user_id = payment.user_id,
                        host = %target.host.host_name,
                        alias = %request.alias,
                        error = %e,
                        "Provisioning failed for paid purchase"
                    );
                    failed_hosts.push(target.host.host_name);
                }
            }
        }

        if keys.is_empty() {
            return self
                .fail(callback, Some(&plan), "no host could be provisioned".to_string())
                .await;
        }

        let mut bookkeeping_errors = Vec::new();
        if let Err(e) = self
            .store
            .record_purchase(payment.user_id, payment.price_cents, plan.months)
            .await
        {
            bookkeeping_errors.push(format!("purchase stats: {e}"));
        }
        if let Err(e) = self.reward_referrer(payment.user_id, payment.price_cents).await {
            bookkeeping_errors.push(format!("referral reward: {e}"));
        }
        if let Err(e) = self.rearm_notifications(&keys).await {
            bookkeeping_errors.push(format!("notification re-arm: {e}"));
        }
        for error in &bookkeeping_errors {
            tracing::error!(
                user_id = payment.user_id,
                provider = callback.provider,
                external_id = %callback.external_id.as_str(),
                error = %error,
                "Purchase bookkeeping failed after provisioning"
            );
        }

        self.store
            .log_transaction(&NewTransaction {
                user_id: payment.user_id,
                status: STATUS_PAID,
                amount_cents: payment.price_cents,
                payment_method: payment.payment_method.clone(),
                provider: callback.provider.to_string(),
                external_id: callback.external_id.as_str().to_string(),
                plan_id: Some(plan.plan_id),
                host_name: Some(plan.host_name.clone()),
                metadata: Some(json!({
                    "action": payment.action,
                    "months": plan.months,
                    "keys": keys.iter().map(|k| k.alias.as_str()).collect::<Vec<_>>(),
                    "failed_hosts": failed_hosts,
                    "customer_email": payment.customer_email,
                    "bookkeeping_errors": bookkeeping_errors,
                })),
            })
            .await
            .inspect_err(|e| {
                tracing::error!(
                    user_id = payment.user_id,
                    provider = callback.provider,
                    external_id = %callback.external_id.as_str(),
                    keys = ?keys.iter().map(|k| k.alias.as_str()).collect::<Vec<_>>(),
                    error = %e,
                    "Keys granted but the transaction could not be logged"
                );
            })?;

        tracing::info!(
            user_id = payment.user_id,
            plan_id = plan.plan_id,
            provider = callback.provider,
            keys = keys.len(),
            failed_hosts = failed_hosts.len(),
            processed_at = %now,
            "Payment completed"
        );

        Ok(GateOutcome::Completed(PurchaseSummary {
            user_id: payment.user_id,
            plan_id: plan.plan_id,
            amount_cents: payment.price_cents,
            keys,
            failed_hosts,
        }))
    }

    /// Load the plan and the targets. Nothing is written.
    async fn prepare(&self, callback: &PaymentCallback) -> Result<Prepared, StoreError> {
        let Some(plan) = self.store.plan(callback.payment.plan_id).await? else {
            return Ok(Prepared::Rejected(
                None,
                format!("plan {} not found", callback.payment.plan_id),
            ));
        };

        Ok(match self.targets(callback, &plan).await? {
            Ok(targets) => Prepared::Ready(plan, targets),
            Err(reason) => Prepared::Rejected(Some(plan), reason),
        })
    }

    /// Hosts to provision for this payment.
    ///
    /// The inner `Err` is a business rejection that is booked as a failed
    /// transaction; the outer one is a store failure.
    async fn targets(
        &self,
        callback: &PaymentCallback,
        plan: &Plan,
    ) -> Result<Result<Vec<Target>, String>, StoreError> {
        let user_id = callback.payment.user_id;
        let global_plan_ids = self.store.global_plan_ids().await?;
        let user_keys = self.store.keys_for_user(user_id).await?;

        // Global purchases tag every key with the global plan. Individual ones
        // keep a global tag the key already carries.
        let tag_for = |existing: Option<&Key>| match existing {
            _ if plan.is_global() => plan.plan_id,
            Some(key) if global_plan_ids.contains(&key.plan_id) => key.plan_id,
            _ => plan.plan_id,
        };

        if let PaymentAction::Extend { key_id } = callback.payment.action {
            let Some(key) = user_keys.iter().find(|key| key.key_id == key_id) else {
                return Ok(Err(format!("key {key_id} does not belong to user {user_id}")));
            };
            let Some(host) = self.store.host(&key.host_name).await? else {
                return Ok(Err(format!("host {} not found", key.host_name)));
            };
            return Ok(Ok(vec![Target {
                host,
                alias: key.alias.clone(),
                plan_tag: tag_for(Some(key)),
            }]));
        }

        let hosts = if plan.is_global() {
            let hosts = self.store.hosts(true).await?;
            if hosts.is_empty() {
                return Ok(Err("no enabled hosts for global plan".to_string()));
            }
            hosts
        } else {
            let host_name = callback
                .payment
                .host_name
                .clone()
                .unwrap_or_else(|| plan.host_name.clone());
            match self.store.host(&host_name).await? {
                Some(host) if host.is_enabled => vec![host],
                Some(_) => return Ok(Err(format!("host {host_name} is disabled"))),
                None => return Ok(Err(format!("host {host_name} not found"))),
            }
        };

        let mut next_number = next_key_number(&user_keys, user_id);
        let mut targets = Vec::with_capacity(hosts.len());

        for host in hosts {
            let existing = user_keys
                .iter()
                .filter(|key| key.host_name == host.host_name && key.is_paid())
                .max_by_key(|key| key.expires_at);

            let alias = match existing {
                Some(key) => key.alias.clone(),
                None => {
                    let alias = purchase_alias(user_id, next_number, &host.slug());
                    next_number += 1;
                    alias
                }
            };

            targets.push(Target {
                plan_tag: tag_for(existing),
                alias,
                host,
            });
        }

        Ok(Ok(targets))
    }

    async fn reward_referrer(&self, user_id: i64, price_cents: i64) -> Result<(), StoreError> {
        let Some(referrer) = self
            .store
            .user(user_id)
            .await?
            .and_then(|user| user.referred_by)
        else {
            return Ok(());
        };

        let percentage = self
            .store
            .setting(settings::REFERRAL_PERCENTAGE)
            .await?
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0)
            .clamp(0, 100);

        let reward = price_cents * percentage / 100;
        if reward > 0 {
            self.store.add_referral_balance(referrer, reward).await?;
            tracing::info!(referrer, user_id, reward_cents = reward, "Referral reward credited");
        }
        Ok(())
    }

    /// Renewed entities start their thresholds afresh.
    async fn rearm_notifications(&self, keys: &[Key]) -> Result<(), StoreError> {
        let global_plan_ids = self.store.global_plan_ids().await?;
        for key in keys {
            rearm(self.store.as_ref(), key, &global_plan_ids).await?;
        }
        Ok(())
    }

    /// Book a failed transaction and report it.
    async fn fail(
        &self,
        callback: &PaymentCallback,
        plan: Option<&Plan>,
        reason: String,
    ) -> Result<GateOutcome, GateError> {
        let payment = &callback.payment;
        tracing::error!(
            user_id = payment.user_id,
            plan_id = payment.plan_id,
            provider = callback.provider,
            reason = %reason,
            "Payment could not be fulfilled"
        );

        let logged = self
            .store
            .log_transaction(&NewTransaction {
                user_id: payment.user_id,
                status: STATUS_FAILED,
                amount_cents: payment.price_cents,
                payment_method: payment.payment_method.clone(),
                provider: callback.provider.to_string(),
                external_id: callback.external_id.as_str().to_string(),
                plan_id: plan.map(|p| p.plan_id),
                host_name: plan.map(|p| p.host_name.clone()).or_else(|| payment.host_name.clone()),
                metadata: Some(json!({
                    "action": payment.action,
                    "reason": reason,
                })),
            })
            .await;

        // Nothing was granted; let the provider retry
        if let Err(e) = logged {
            self.release(callback.provider, callback.external_id.as_str()).await;
            return Err(e.into());
        }

        Ok(GateOutcome::Failed(reason))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        models::{
            host::GLOBAL_HOST,
            notification::NotificationKind,
            key::NewKey,
            webhook::{CompletedPayment, ExternalId},
        },
        panel::InMemoryPanel,
        store::InMemoryStore,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn host(name: &str) -> Host {
        Host {
            host_name: name.to_string(),
            host_url: format!("https://{name}.panel.example:2053"),
            host_username: "admin".to_string(),
            host_password: "secret".to_string(),
            inbound_id: 1,
            is_enabled: true,
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        panel: Arc<InMemoryPanel>,
        gate: PaymentGate,
        global: Plan,
        monthly_nl: Plan,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(InMemoryPanel::new(now()));
        store.upsert_host(&host("nl")).await.unwrap();
        store.upsert_host(&host("de")).await.unwrap();
        store.register_user(1, Some("referrer"), None).await.unwrap();
        store.register_user(7, Some("alice"), Some(1)).await.unwrap();
        let global = store.create_plan(GLOBAL_HOST, "Global month", 1, 800).await.unwrap();
        let monthly_nl = store.create_plan("nl", "NL month", 1, 300).await.unwrap();
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            panel.clone(),
            std::time::Duration::from_millis(200),
        ));
        let gate = PaymentGate::new(store.clone(), provisioner);
        Fixture {
            store,
            panel,
            gate,
            global,
            monthly_nl,
        }
    }

    fn callback(id: &str, plan_id: i64, action: PaymentAction) -> PaymentCallback {
        PaymentCallback {
            provider: "cryptobot",
            external_id: ExternalId::Native(id.to_string()),
            payment: CompletedPayment {
                user_id: 7,
                plan_id,
                host_name: None,
                action,
                price_cents: 800,
                payment_method: "USDT".to_string(),
                customer_email: None,
            },
        }
    }

    #[tokio::test]
    async fn global_purchase_provisions_every_enabled_host() {
        let f = fixture().await;

        let outcome = f
            .gate
            .process(callback("inv-1", f.global.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        let GateOutcome::Completed(summary) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.keys.len(), 2);
        assert!(summary.keys.iter().all(|k| k.plan_id == f.global.plan_id));
        assert!(summary.keys.iter().all(|k| k.expires_at == now() + Duration::days(30)));
        let aliases: Vec<_> = summary.keys.iter().map(|k| k.alias.as_str()).collect();
        assert!(aliases.contains(&"user7-key1-nl") || aliases.contains(&"user7-key2-nl"));

        let user = f.store.user(7).await.unwrap().unwrap();
        assert_eq!(user.total_spent_cents, 800);
        assert_eq!(user.total_months, 1);
        assert!(!user.pending_payment);
    }

    #[tokio::test]
    async fn repeated_callback_mutates_once() {
        let f = fixture().await;
        let cb = callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New);

        f.gate.process(cb.clone(), now()).await.unwrap();
        let second = f.gate.process(cb, now()).await.unwrap();

        assert!(matches!(second, GateOutcome::Duplicate));
        assert_eq!(f.store.transactions_for_user(7).await.unwrap().len(), 1);
        let keys = f.store.keys_for_user(7).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].expires_at, now() + Duration::days(30));
    }

    #[tokio::test]
    async fn repeated_digest_callback_mutates_once() {
        let f = fixture().await;
        let mut cb = callback("", f.monthly_nl.plan_id, PaymentAction::New);
        cb.external_id = ExternalId::digest_of("7:1:3.00:new");

        f.gate.process(cb.clone(), now()).await.unwrap();
        let second = f.gate.process(cb, now()).await.unwrap();

        assert!(matches!(second, GateOutcome::Duplicate));
        assert_eq!(f.store.transactions_for_user(7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn busy_user_rejects_without_side_effects_and_retry_succeeds() {
        let f = fixture().await;
        assert!(f.store.try_begin_payment(7).await.unwrap());
        let cb = callback("inv-9", f.monthly_nl.plan_id, PaymentAction::New);

        let outcome = f.gate.process(cb.clone(), now()).await.unwrap();

        assert!(matches!(outcome, GateOutcome::Busy));
        assert!(f.store.keys_for_user(7).await.unwrap().is_empty());
        assert!(f.store.transactions_for_user(7).await.unwrap().is_empty());
        assert!(!f.store.is_webhook_processed("cryptobot", "inv-9").await.unwrap());

        f.store.finish_payment(7).await.unwrap();
        let retried = f.gate.process(cb, now()).await.unwrap();
        assert!(matches!(retried, GateOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn concurrent_completions_let_only_one_through() {
        let f = fixture().await;
        let a = callback("inv-a", f.monthly_nl.plan_id, PaymentAction::New);
        let b = callback("inv-b", f.monthly_nl.plan_id, PaymentAction::New);

        let (first, second) = tokio::join!(f.gate.process(a, now()), f.gate.process(b, now()));
        let outcomes = [first.unwrap(), second.unwrap()];

        let completed = outcomes.iter().filter(|o| matches!(o, GateOutcome::Completed(_))).count();
        let busy = outcomes.iter().filter(|o| matches!(o, GateOutcome::Busy)).count();
        assert_eq!((completed, busy), (1, 1));
        assert_eq!(f.store.transactions_for_user(7).await.unwrap().len(), 1);
        assert_eq!(
            f.store.keys_for_user(7).await.unwrap()[0].expires_at,
            now() + Duration::days(30)
        );
    }

    #[tokio::test]
    async fn global_purchase_extends_and_retags_existing_keys() {
        let f = fixture().await;
        f.gate
            .process(callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        f.gate
            .process(callback("inv-2", f.global.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        let keys = f.store.keys_for_user(7).await.unwrap();
        assert_eq!(keys.len(), 2);
        let nl = keys.iter().find(|k| k.host_name == "nl").unwrap();
        assert_eq!(nl.alias, "user7-key1-nl");
        assert_eq!(nl.plan_id, f.global.plan_id);
        assert_eq!(nl.expires_at, now() + Duration::days(60));
        let de = keys.iter().find(|k| k.host_name == "de").unwrap();
        assert_eq!(de.alias, "user7-key2-de");
    }

    #[tokio::test]
    async fn extending_someone_elses_key_is_booked_as_failed() {
        let f = fixture().await;
        let foreign = f
            .store
            .upsert_key(&NewKey {
                user_id: 1,
                host_name: "nl".to_string(),
                client_id: "c".to_string(),
                alias: "user1-key1-nl".to_string(),
                expires_at: now() + Duration::days(3),
                connection_descriptor: None,
                plan_id: f.monthly_nl.plan_id,
            })
            .await
            .unwrap();

        let outcome = f
            .gate
            .process(
                callback("inv-1", f.monthly_nl.plan_id, PaymentAction::Extend { key_id: foreign.key_id }),
                now(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, GateOutcome::Failed(_)));
        let transactions = f.store.transactions_for_user(7).await.unwrap();
        assert_eq!(transactions[0].status, STATUS_FAILED);
        assert!(!f.store.user(7).await.unwrap().unwrap().pending_payment);
    }

    #[tokio::test]
    async fn unknown_plan_is_booked_as_failed() {
        let f = fixture().await;
        let outcome = f
            .gate
            .process(callback("inv-1", 999, PaymentAction::New), now())
            .await
            .unwrap();

        assert!(matches!(outcome, GateOutcome::Failed(_)));
        assert_eq!(f.store.transactions_for_user(7).await.unwrap()[0].status, STATUS_FAILED);
    }

    #[tokio::test]
    async fn unreachable_panel_fails_and_releases_the_user() {
        let f = fixture().await;
        f.panel.set_unreachable("nl", true);

        let outcome = f
            .gate
            .process(callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        assert!(matches!(outcome, GateOutcome::Failed(_)));
        assert!(!f.store.user(7).await.unwrap().unwrap().pending_payment);
        let user = f.store.user(7).await.unwrap().unwrap();
        assert_eq!(user.total_spent_cents, 0);
    }

    #[tokio::test]
    async fn partial_global_failure_still_completes() {
        let f = fixture().await;
        f.panel.set_hanging("de", true);

        let outcome = f
            .gate
            .process(callback("inv-1", f.global.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        let GateOutcome::Completed(summary) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(summary.keys.len(), 1);
        assert_eq!(summary.failed_hosts, vec!["de".to_string()]);
    }

    #[tokio::test]
    async fn referrer_gets_their_share() {
        let f = fixture().await;
        f.store.set_setting(settings::REFERRAL_PERCENTAGE, "10").await.unwrap();

        f.gate
            .process(callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        assert_eq!(f.store.user(1).await.unwrap().unwrap().referral_balance_cents, 80);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_and_released() {
        let f = fixture().await;
        let mut cb = callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New);
        cb.payment.user_id = 404;

        let err = f.gate.process(cb, now()).await.unwrap_err();

        assert!(matches!(err, GateError::UnknownUser(404)));
        assert!(!f.store.is_webhook_processed("cryptobot", "inv-1").await.unwrap());
    }

    #[tokio::test]
    async fn renewal_rearms_expiry_notices() {
        let f = fixture().await;
        f.gate
            .process(callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New), now())
            .await
            .unwrap();
        let key = f.store.keys_for_user(7).await.unwrap().remove(0);
        f.store
            .record_notification(7, Some(key.key_id), NotificationKind::Expiry, 24, now())
            .await
            .unwrap();

        f.gate
            .process(
                callback("inv-2", f.monthly_nl.plan_id, PaymentAction::Extend { key_id: key.key_id }),
                now(),
            )
            .await
            .unwrap();

        assert!(
            f.store
                .sent_thresholds(7, Some(key.key_id), NotificationKind::Expiry)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn startup_reset_clears_leftover_flags() {
        let f = fixture().await;
        f.store.try_begin_payment(7).await.unwrap();

        assert_eq!(f.gate.reset_pending().await.unwrap(), 1);
        assert!(!f.store.user(7).await.unwrap().unwrap().pending_payment);
    }

    #[tokio::test]
    async fn store_failure_before_provisioning_releases_the_callback() {
        let f = fixture().await;
        let operations = [
            "user",
            "try_begin_payment",
            "plan",
            "global_plan_ids",
            "keys_for_user",
            "host",
        ];

        for (n, operation) in operations.into_iter().enumerate() {
            let cb = callback(&format!("inv-{n}"), f.monthly_nl.plan_id, PaymentAction::New);
            f.store.fail_on(operation, true);

            let result = f.gate.process(cb.clone(), now()).await;
            f.store.fail_on(operation, false);

            assert!(
                matches!(result, Err(GateError::Store(_))),
                "{operation}: expected a store error, got {result:?}"
            );
            assert!(
                !f.store.is_webhook_processed("cryptobot", &format!("inv-{n}")).await.unwrap(),
                "{operation}: callback id was kept"
            );
            assert!(!f.store.user(7).await.unwrap().unwrap().pending_payment);

            // The provider's retry goes through once the store recovers
            let retry = f.gate.process(cb, now()).await.unwrap();
            assert!(
                matches!(retry, GateOutcome::Completed(_)),
                "{operation}: retry got {retry:?}"
            );
        }

        assert_eq!(
            f.store.transactions_for_user(7).await.unwrap().len(),
            operations.len()
        );
    }

    #[tokio::test]
    async fn bookkeeping_failure_after_provisioning_still_logs_the_purchase() {
        let f = fixture().await;
        f.store.fail_on("record_purchase", true);

        let outcome = f
            .gate
            .process(callback("inv-1", f.monthly_nl.plan_id, PaymentAction::New), now())
            .await
            .unwrap();

        assert!(matches!(outcome, GateOutcome::Completed(_)));
        assert!(f.store.is_webhook_processed("cryptobot", "inv-1").await.unwrap());
        let transactions = f.store.transactions_for_user(7).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, STATUS_PAID);
        let metadata = transactions[0].metadata.clone().unwrap();
        assert_eq!(metadata["bookkeeping_errors"].as_array().unwrap().len(), 1);
        assert_eq!(f.store.keys_for_user(7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unlogged_rejection_releases_the_callback() {
        let f = fixture().await;
        f.store.fail_on("log_transaction", true);

        let result = f
            .gate
            .process(callback("inv-1", 999, PaymentAction::New), now())
            .await;

        assert!(matches!(result, Err(GateError::Store(_))));
        assert!(!f.store.is_webhook_processed("cryptobot", "inv-1").await.unwrap());
        assert!(f.panel.clients("nl").is_empty());
    }
}
