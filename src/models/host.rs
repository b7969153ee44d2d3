//! Provisioning panel targets.

use serde::{Deserialize, Serialize};

/// Reserved host name that marks a plan as global (valid on every enabled host).
pub const GLOBAL_HOST: &str = "ALL";

/// A remote provisioning panel and the inbound keys are issued on.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Host {
    pub host_name: String,

    /// Base URL of the panel, including any web base path
    pub host_url: String,

    pub host_username: String,

    #[serde(skip_serializing)]
    pub host_password: String,

    /// Inbound on the panel that holds this shop's clients
    pub inbound_id: i32,

    /// Disabled hosts are skipped by the reconciler and hidden from the feed
    pub is_enabled: bool,
}

impl Host {
    /// Lowercase host name with whitespace removed, used inside aliases.
    pub fn slug(&self) -> String {
        host_slug(&self.host_name)
    }
}

pub fn host_slug(host_name: &str) -> String {
    host_name
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
