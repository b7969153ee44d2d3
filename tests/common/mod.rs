//! Shared fixtures: the full application over the in-memory store and panel.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};

use entitlement_sync_server::{
    handlers,
    models::host::Host,
    panel::InMemoryPanel,
    payments::yookassa::InMemoryStatusLookup,
    services::{
        payment_gate::PaymentGate, provisioning::Provisioner,
        subscription_service::SubscriptionService,
    },
    state::AppState,
    store::{EntitlementStore, InMemoryStore},
};

pub const PANEL_TIMEOUT: Duration = Duration::from_millis(300);

pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub panel: Arc<InMemoryPanel>,
    pub provisioner: Arc<Provisioner>,
    pub gate: PaymentGate,
    pub subscriptions: Arc<SubscriptionService>,
    pub yookassa: InMemoryStatusLookup,
}

impl TestApp {
    pub fn new(now: DateTime<Utc>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(InMemoryPanel::new(now));
        let provisioner = Arc::new(Provisioner::new(store.clone(), panel.clone(), PANEL_TIMEOUT));
        let gate = PaymentGate::new(store.clone(), provisioner.clone());
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            provisioner.clone(),
            PANEL_TIMEOUT,
        ));
        Self {
            store,
            panel,
            provisioner,
            gate,
            subscriptions,
            yookassa: InMemoryStatusLookup::new(),
        }
    }

    pub fn router(&self) -> Router {
        handlers::router(AppState {
            store: self.store.clone(),
            subscriptions: self.subscriptions.clone(),
            gate: self.gate.clone(),
            yookassa: Arc::new(self.yookassa.clone()),
        })
    }

    pub async fn add_host(&self, name: &str) {
        self.store.upsert_host(&host(name)).await.unwrap();
    }
}

pub fn host(name: &str) -> Host {
    Host {
        host_name: name.to_string(),
        host_url: format!("https://{name}.panel.example:2053/panel"),
        host_username: "admin".to_string(),
        host_password: "secret".to_string(),
        inbound_id: 1,
        is_enabled: true,
    }
}
