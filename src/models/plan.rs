//! Purchasable plans.

use serde::Serialize;

use super::host::GLOBAL_HOST;

/// Days granted per purchased month.
pub const DAYS_PER_MONTH: i64 = 30;

/// What a purchase grants: a duration on one host, or on every host for
/// global plans.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct Plan {
    pub plan_id: i64,

    /// Target host, or [`GLOBAL_HOST`] for a global plan
    pub host_name: String,

    pub plan_name: String,

    pub months: i32,

    /// Price in cents
    pub price_cents: i64,
}

impl Plan {
    pub fn is_global(&self) -> bool {
        self.host_name == GLOBAL_HOST
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.months) * DAYS_PER_MONTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_counts_thirty_days_per_month() {
        let plan = Plan {
            plan_id: 1,
            host_name: GLOBAL_HOST.to_string(),
            plan_name: "Quarter".to_string(),
            months: 3,
            price_cents: 90_00,
        };
        assert!(plan.is_global());
        assert_eq!(plan.duration(), chrono::Duration::days(90));
    }
}
