//! Application configuration management.
//!
//! Process-level configuration comes from environment variables through the
//! `envy` crate. Runtime settings that operators change while the service is
//! running (feed title, provider secrets, feature toggles) live in the
//! `settings` table and are read through the entitlement store instead.

use std::time::Duration;

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `SYNC_INTERVAL_SECS` (optional): pause between background cycles, defaults to 300
/// - `STARTUP_DELAY_SECS` (optional): delay before the first cycle, defaults to 10
/// - `GRACE_PERIOD_DAYS` (optional): days after expiry before a key is hard-deleted, defaults to 5
/// - `PANEL_TIMEOUT_SECS` (optional): bound on every panel call, defaults to 10
/// - `TRAFFIC_TIMEOUT_SECS` (optional): bound on each live traffic fetch, defaults to 3
/// - `NOTIFICATION_RETENTION_DAYS` (optional): ledger pruning horizon, defaults to 30
/// - `TELEGRAM_BOT_TOKEN` (optional): enables expiry notifications when set
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,

    #[serde(default = "default_grace_period")]
    pub grace_period_days: i64,

    #[serde(default = "default_panel_timeout")]
    pub panel_timeout_secs: u64,

    #[serde(default = "default_traffic_timeout")]
    pub traffic_timeout_secs: u64,

    #[serde(default = "default_notification_retention")]
    pub notification_retention_days: i64,

    #[serde(default)]
    pub telegram_bot_token: Option<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_sync_interval() -> u64 {
    300
}

fn default_startup_delay() -> u64 {
    10
}

fn default_grace_period() -> i64 {
    5
}

fn default_panel_timeout() -> u64 {
    10
}

fn default_traffic_timeout() -> u64 {
    3
}

fn default_notification_retention() -> i64 {
    30
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file is loaded first when present.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing (e.g. `DATABASE_URL`)
    /// or a value cannot be parsed into the expected type.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn panel_timeout(&self) -> Duration {
        Duration::from_secs(self.panel_timeout_secs)
    }

    pub fn traffic_timeout(&self) -> Duration {
        Duration::from_secs(self.traffic_timeout_secs)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.grace_period_days)
    }

    pub fn notification_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.notification_retention_days)
    }
}

/// Keys of the runtime settings table.
pub mod settings {
    pub const SUBSCRIPTION_NAME: &str = "subscription_name";
    pub const SUBSCRIPTION_UPDATE_INTERVAL_HOURS: &str = "subscription_update_interval_hours";
    pub const SUBSCRIPTION_AUTO_PROVISION: &str = "subscription_auto_provision";
    pub const SUBSCRIPTION_LIVE_STATS: &str = "subscription_live_stats";
    pub const SUBSCRIPTION_REGENERATE_DESCRIPTORS: &str = "subscription_regenerate_descriptors";
    pub const REFERRAL_PERCENTAGE: &str = "referral_percentage";
    pub const CRYPTOBOT_TOKEN: &str = "cryptobot_token";
    pub const CRYPTOBOT_WEBHOOK_SECRET: &str = "cryptobot_webhook_secret";
    pub const HELEKET_API_KEY: &str = "heleket_api_key";
    pub const YOOKASSA_SHOP_ID: &str = "yookassa_shop_id";
    pub const YOOKASSA_SECRET_KEY: &str = "yookassa_secret_key";

    /// Interpret a stored flag. Anything other than a truthy spelling is false.
    pub fn parse_flag(value: Option<&str>, default: bool) -> bool {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v.is_empty() => default,
            Some(v) => matches!(v.as_str(), "true" | "1" | "yes" | "on"),
            None => default,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn flags_fall_back_to_default_when_unset() {
            assert!(parse_flag(None, true));
            assert!(!parse_flag(None, false));
            assert!(parse_flag(Some(""), true));
        }

        #[test]
        fn flags_accept_common_spellings() {
            assert!(parse_flag(Some("TRUE"), false));
            assert!(parse_flag(Some("1"), false));
            assert!(!parse_flag(Some("false"), true));
            assert!(!parse_flag(Some("nope"), true));
        }
    }
}
