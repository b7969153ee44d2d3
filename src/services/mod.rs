//! Business logic services.
//!
//! Services contain the engine proper, separated from HTTP handlers. They
//! reach the database only through the entitlement store and the panels only
//! through the panel client, so each can be exercised with the in-memory
//! implementations.

use crate::{panel::PanelError, store::StoreError};

pub mod notifier;
pub mod payment_gate;
pub mod provisioning;
pub mod reconciler;
pub mod scheduler;
pub mod subscription_service;

/// A failure inside one unit of engine work (one host, one key, one request).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
