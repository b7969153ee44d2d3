//! Data models representing database entities.

/// Provisioning panel targets
pub mod host;
/// Keys and their tombstones
pub mod key;
/// Expiry notification ledger
pub mod notification;
/// Purchasable plans
pub mod plan;
/// Payment log
pub mod transaction;
/// Customers
pub mod user;
/// Normalized payment callbacks
pub mod webhook;
