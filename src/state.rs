//! State shared by every handler.

use std::sync::Arc;

use crate::{
    payments::yookassa::PaymentStatusLookup,
    services::{payment_gate::PaymentGate, subscription_service::SubscriptionService},
    store::EntitlementStore,
};

/// Cloned into each request by axum; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntitlementStore>,
    pub subscriptions: Arc<SubscriptionService>,
    pub gate: PaymentGate,

    /// Confirms YooKassa notifications before they reach the gate
    pub yookassa: Arc<dyn PaymentStatusLookup>,
}
