//! Entitlement reconciliation and subscription aggregation server.
//!
//! Keeps three views of a user's access in step: the clients on each remote
//! provisioning panel, the local entitlement store, and the subscription feed
//! the user's client app polls. Payment callbacks feed purchases in through an
//! idempotent gate; a background loop reconciles keys against the panels and
//! sends expiry notices.

pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod models;
pub mod panel;
pub mod payments;
pub mod services;
pub mod state;
pub mod store;
