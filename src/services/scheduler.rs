//! The background loop.
//!
//! One long-lived task runs reconciliation, ledger pruning and expiry
//! notification in that order, then sleeps for the sync interval. A shutdown
//! signal interrupts either the cycle or the sleep; every store mutation is a
//! single statement or a small transaction, so stopping mid-cycle leaves
//! consistent data behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::store::EntitlementStore;

use super::{
    notifier::{NotifyReport, Notifier},
    reconciler::{ReconcileReport, Reconciler},
};

/// What one cycle did. A `None` stage failed or did not run.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub reconcile: Option<ReconcileReport>,
    pub pruned_notifications: Option<u64>,
    pub notify: Option<NotifyReport>,
}

pub struct Scheduler {
    store: Arc<dyn EntitlementStore>,
    reconciler: Reconciler,
    /// `None` when no message transport is configured
    notifier: Option<Notifier>,
    notification_retention: chrono::Duration,
    interval: Duration,
    startup_delay: Duration,
}

impl Scheduler {
    /// # Arguments
    ///
    /// * `notifier` - `None` skips the notification stage
    /// * `notification_retention` - age past which ledger rows are pruned
    /// * `interval` - pause between the end of one cycle and the next
    /// * `startup_delay` - wait before the first cycle
    ///
    /// # Configuration
    ///
    /// `SYNC_INTERVAL_SECS`, `STARTUP_DELAY_SECS` and
    /// `NOTIFICATION_RETENTION_DAYS` feed the durations.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        reconciler: Reconciler,
        notifier: Option<Notifier>,
        notification_retention: chrono::Duration,
        interval: Duration,
        startup_delay: Duration,
    ) -> Self {
        Self {
            store,
            reconciler,
            notifier,
            notification_retention,
            interval,
            startup_delay,
        }
    }

    /// Run one cycle. Each stage's failure is logged and the next stage
    /// still runs.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        match self.reconciler.run_pass(now).await {
            Ok(pass) => report.reconcile = Some(pass),
            Err(e) => tracing::error!(error = %e, "Reconciliation pass failed"),
        }

        match self
            .store
            .prune_notifications(now - self.notification_retention)
            .await
        {
            Ok(pruned) => {
                if pruned > 0 {
                    tracing::info!(pruned, "Pruned old notification ledger rows");
                }
                report.pruned_notifications = Some(pruned);
            }
            Err(e) => tracing::error!(error = %e, "Notification ledger pruning failed"),
        }

        if let Some(notifier) = &self.notifier {
            match notifier.run_cycle(now).await {
                Ok(notified) => report.notify = Some(notified),
                Err(e) => tracing::error!(error = %e, "Notification cycle failed"),
            }
        }

        report
    }

    /// Loop until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.notifier.is_none() {
            tracing::warn!("No message transport configured, expiry notifications are off");
        }

        tracing::info!(
            delay_secs = self.startup_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Background sync scheduled"
        );

        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            _ = tokio::time::sleep(self.startup_delay) => {}
        }

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = self.run_cycle(Utc::now()) => {}
            }

            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Background sync stopped");
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a shutdown request
    let _ = shutdown.wait_for(|stop| *stop).await;
}
