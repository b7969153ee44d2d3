//! Expiry notifications.
//!
//! Each cycle derives hours-remaining for every notifiable entity and fires
//! at most one threshold per entity. The sent-notification ledger is the only
//! memory between cycles: a threshold is skipped when it, or any later stage,
//! was already delivered, and a row is written only after delivery succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    delivery::MessageSender,
    models::{key::Key, notification::NotificationKind},
    store::{EntitlementStore, StoreResult},
};

/// Thresholds for paid entitlements, in hours remaining.
pub const PAID_THRESHOLDS: [i32; 4] = [24, 1, 0, -24];

/// Thresholds for trial keys.
pub const TRIAL_THRESHOLDS: [i32; 3] = [1, 0, -24];

const MS_PER_HOUR: i64 = 3_600_000;

/// Whole hours until `expires_at`, rounded up.
pub fn hours_remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let ms = (expires_at - now).num_milliseconds();
    let hours = ms.div_euclid(MS_PER_HOUR);
    if ms.rem_euclid(MS_PER_HOUR) > 0 {
        hours + 1
    } else {
        hours
    }
}

/// The smallest threshold `t` with `t - 1 < hours <= t`.
pub fn select_threshold(thresholds: &[i32], hours: i64) -> Option<i32> {
    thresholds
        .iter()
        .copied()
        .filter(|t| i64::from(*t) - 1 < hours && hours <= i64::from(*t))
        .min()
}

/// Something that receives expiry notices: one key, or a user's whole set of
/// global keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyTarget {
    pub user_id: i64,
    /// `None` for a global group
    pub key_id: Option<i64>,
    pub kind: NotificationKind,
    pub host_name: Option<String>,
    /// Soonest expiry among the members
    pub expires_at: DateTime<Utc>,
    pub member_count: usize,
    pub trial: bool,
}

impl NotifyTarget {
    pub fn thresholds(&self) -> &'static [i32] {
        if self.trial {
            &TRIAL_THRESHOLDS
        } else {
            &PAID_THRESHOLDS
        }
    }
}

/// Split keys into global groups and individual keys.
///
/// Tombstoned keys are ignored. Users with a global group get no individual
/// notices in the same cycle.
pub fn partition(keys: &[Key], global_plan_ids: &BTreeSet<i64>) -> Vec<NotifyTarget> {
    let live: Vec<&Key> = keys.iter().filter(|key| !key.is_tombstoned()).collect();

    let mut groups: BTreeMap<i64, (DateTime<Utc>, usize)> = BTreeMap::new();
    for key in live.iter().filter(|key| global_plan_ids.contains(&key.plan_id)) {
        groups
            .entry(key.user_id)
            .and_modify(|(soonest, count)| {
                *soonest = (*soonest).min(key.expires_at);
                *count += 1;
            })
            .or_insert((key.expires_at, 1));
    }

    let mut targets: Vec<NotifyTarget> = groups
        .iter()
        .map(|(user_id, (soonest, count))| NotifyTarget {
            user_id: *user_id,
            key_id: None,
            kind: NotificationKind::GlobalExpiry,
            host_name: None,
            expires_at: *soonest,
            member_count: *count,
            trial: false,
        })
        .collect();

    targets.extend(
        live.iter()
            .filter(|key| !groups.contains_key(&key.user_id))
            .map(|key| NotifyTarget {
                user_id: key.user_id,
                key_id: Some(key.key_id),
                kind: NotificationKind::Expiry,
                host_name: Some(key.host_name.clone()),
                expires_at: key.expires_at,
                member_count: 1,
                trial: key.is_trial(),
            }),
    );

    targets
}

/// Text for a notice at `threshold` hours.
pub fn render_message(target: &NotifyTarget, threshold: i32) -> String {
    let subject = match (&target.kind, &target.host_name) {
        (NotificationKind::GlobalExpiry, _) => {
            format!("Your global subscription ({} servers)", target.member_count)
        }
        (_, Some(host)) if target.trial => format!("Your trial key for {host}"),
        (_, Some(host)) => format!("Your key for {host}"),
        (_, None) => "Your key".to_string(),
    };
    let date = target.expires_at.format("%Y-%m-%d %H:%M UTC");

    match threshold {
        t if t > 1 => format!("{subject} expires in {t} hours ({date}). Renew it to keep access."),
        1 => format!("{subject} expires in 1 hour ({date})."),
        0 => format!("{subject} has expired. Renew it to restore access."),
        _ => format!("{subject} expired yesterday. Renew it now to get your access back."),
    }
}

/// Forget the notices already sent for a renewed key.
///
/// Clears the key's own ledger rows and, when the key is tagged with a
/// global plan, the rows of the user's global subscription. Both the payment
/// gate and the reconciler call this after an expiry moves forward.
///
/// # Errors
///
/// Returns the store error of the first ledger delete that fails.
pub async fn rearm(
    store: &dyn EntitlementStore,
    key: &Key,
    global_plan_ids: &BTreeSet<i64>,
) -> StoreResult<()> {
    store
        .forget_notifications(key.user_id, Some(key.key_id), NotificationKind::Expiry)
        .await?;
    if global_plan_ids.contains(&key.plan_id) {
        store
            .forget_notifications(key.user_id, None, NotificationKind::GlobalExpiry)
            .await?;
    }
    Ok(())
}

/// Counters for one notifier cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub sent: usize,
    pub already_sent: usize,
    pub failed: usize,
}

/// Emits at most one notice per (entity, threshold).
pub struct Notifier {
    store: Arc<dyn EntitlementStore>,
    sender: Arc<dyn MessageSender>,
}

impl Notifier {
    /// # Arguments
    ///
    /// * `store` - source of keys and the SentNotification ledger
    /// * `sender` - message transport; a failed send writes no ledger row
    pub fn new(store: Arc<dyn EntitlementStore>, sender: Arc<dyn MessageSender>) -> Self {
        Self { store, sender }
    }

    /// Evaluate every entity once.
    ///
    /// # Errors
    ///
    /// Only loading the keys or plans can fail the cycle. Per-entity failures
    /// are logged and counted.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> StoreResult<NotifyReport> {
        let keys = self.store.all_keys().await?;
        let global_plan_ids = self.store.global_plan_ids().await?;
        let mut report = NotifyReport::default();

        for target in partition(&keys, &global_plan_ids) {
            let hours = hours_remaining(target.expires_at, now);
            let Some(threshold) = select_threshold(target.thresholds(), hours) else {
                continue;
            };

            match self.notify(&target, threshold, now).await {
                Ok(true) => report.sent += 1,
                Ok(false) => report.already_sent += 1,
                Err(e) => {
                    tracing::warn!(
                        user_id = target.user_id,
                        key_id = ?target.key_id,
                        kind = %target.kind,
                        threshold,
                        error = %e,
                        "Expiry notice not delivered, will retry next cycle"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.sent > 0 || report.failed > 0 {
            tracing::info!(
                sent = report.sent,
                failed = report.failed,
                "Expiry notices processed"
            );
        }

        Ok(report)
    }

    /// Returns `Ok(false)` when the ledger already covers this threshold.
    async fn notify(
        &self,
        target: &NotifyTarget,
        threshold: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, NotifyError> {
        let sent = self
            .store
            .sent_thresholds(target.user_id, target.key_id, target.kind)
            .await?;

        // Same threshold, or a later stage, already went out
        if sent.iter().any(|s| *s <= threshold) {
            return Ok(false);
        }

        self.sender
            .send(target.user_id, &render_message(target, threshold))
            .await?;

        self.store
            .record_notification(target.user_id, target.key_id, target.kind, threshold, now)
            .await?;

        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
enum NotifyError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Delivery(#[from] crate::delivery::DeliveryError),
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{delivery::RecordingSender, models::key::NewKey, store::InMemoryStore};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap()
    }

    fn key(key_id: i64, user_id: i64, plan_id: i64, expires_at: DateTime<Utc>) -> Key {
        Key {
            key_id,
            user_id,
            host_name: format!("host{key_id}"),
            client_id: format!("client-{key_id}"),
            alias: format!("user{user_id}-key{key_id}-host{key_id}"),
            expires_at,
            connection_descriptor: None,
            plan_id,
            created_at: t0(),
            missing_since: None,
        }
    }

    #[test]
    fn hours_round_up() {
        let now = t0();
        assert_eq!(hours_remaining(now + Duration::hours(24), now), 24);
        assert_eq!(hours_remaining(now + Duration::minutes(23 * 60 + 1), now), 24);
        assert_eq!(hours_remaining(now + Duration::minutes(30), now), 1);
        assert_eq!(hours_remaining(now, now), 0);
        assert_eq!(hours_remaining(now - Duration::minutes(30), now), 0);
        assert_eq!(hours_remaining(now - Duration::hours(24), now), -24);
        assert_eq!(hours_remaining(now - Duration::minutes(23 * 60 + 1), now), -23);
    }

    #[test]
    fn threshold_fires_only_inside_its_window() {
        assert_eq!(select_threshold(&PAID_THRESHOLDS, 24), Some(24));
        assert_eq!(select_threshold(&PAID_THRESHOLDS, 23), None);
        assert_eq!(select_threshold(&PAID_THRESHOLDS, 1), Some(1));
        assert_eq!(select_threshold(&PAID_THRESHOLDS, 0), Some(0));
        assert_eq!(select_threshold(&PAID_THRESHOLDS, -24), Some(-24));
        assert_eq!(select_threshold(&PAID_THRESHOLDS, -25), None);
        assert_eq!(select_threshold(&TRIAL_THRESHOLDS, 24), None);
    }

    #[test]
    fn global_users_get_one_group_and_no_individual_notices() {
        let globals = BTreeSet::from([9]);
        let keys = vec![
            key(1, 7, 9, t0() + Duration::days(3)),
            key(2, 7, 9, t0() + Duration::days(1)),
            key(3, 7, 4, t0() + Duration::hours(1)),
            key(4, 8, 0, t0() + Duration::hours(1)),
        ];

        let targets = partition(&keys, &globals);

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, NotificationKind::GlobalExpiry);
        assert_eq!(targets[0].expires_at, t0() + Duration::days(1));
        assert_eq!(targets[0].member_count, 2);
        assert_eq!(targets[1].user_id, 8);
        assert!(targets[1].trial);
    }

    #[test]
    fn tombstoned_keys_are_not_notified() {
        let mut tombstoned = key(1, 7, 4, t0() + Duration::hours(1));
        tombstoned.missing_since = Some(t0());
        assert!(partition(&[tombstoned], &BTreeSet::new()).is_empty());
    }

    async fn seeded(expires_at: DateTime<Utc>, plan_id: i64) -> (Arc<InMemoryStore>, RecordingSender, Notifier) {
        let store = Arc::new(InMemoryStore::new());
        store.register_user(7, None, None).await.unwrap();
        store
            .upsert_key(&NewKey {
                user_id: 7,
                host_name: "nl".to_string(),
                client_id: "c1".to_string(),
                alias: "user7-key1-nl".to_string(),
                expires_at,
                connection_descriptor: None,
                plan_id,
            })
            .await
            .unwrap();
        let sender = RecordingSender::new();
        let notifier = Notifier::new(store.clone(), Arc::new(sender.clone()));
        (store, sender, notifier)
    }

    #[tokio::test]
    async fn each_threshold_is_delivered_once_and_in_order() {
        let expiry = t0() + Duration::days(2);
        let (_store, sender, notifier) = seeded(expiry, 3).await;

        // Walk the clock in five-minute cycles from 48h left to 30h past expiry
        let mut now = t0();
        while now < expiry + Duration::hours(30) {
            notifier.run_cycle(now).await.unwrap();
            now += Duration::minutes(5);
        }

        let sent = sender.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].1.contains("24 hours"));
        assert!(sent[1].1.contains("1 hour"));
        assert!(sent[2].1.contains("has expired"));
        assert!(sent[3].1.contains("yesterday"));
    }

    #[tokio::test]
    async fn lower_stage_never_fires_after_a_later_one() {
        let expiry = t0() + Duration::hours(1);
        let (store, sender, notifier) = seeded(expiry, 3).await;
        store
            .record_notification(7, Some(1), NotificationKind::Expiry, 0, t0())
            .await
            .unwrap();

        let report = notifier.run_cycle(t0()).await.unwrap();

        assert_eq!(report.already_sent, 1);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_leaves_no_ledger_row() {
        let expiry = t0() + Duration::hours(24);
        let (store, sender, notifier) = seeded(expiry, 3).await;
        sender.set_failing(true);

        let report = notifier.run_cycle(t0()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(
            store
                .sent_thresholds(7, Some(1), NotificationKind::Expiry)
                .await
                .unwrap()
                .is_empty()
        );

        sender.set_failing(false);
        let report = notifier.run_cycle(t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.sent, 1);
    }
}
