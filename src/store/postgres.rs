//! Postgres implementation of the entitlement store.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{EntitlementStore, StoreResult};
use crate::{
    db::DbPool,
    models::{
        host::{GLOBAL_HOST, Host},
        key::{Key, NewKey},
        notification::NotificationKind,
        plan::Plan,
        transaction::{NewTransaction, Transaction},
        user::{User, generate_subscription_token},
    },
};

/// Key columns with the tombstone's first-seen timestamp joined in.
const KEY_SELECT: &str = r#"
    SELECT k.key_id, k.user_id, k.host_name, k.client_id, k.alias, k.expires_at,
           k.connection_descriptor, k.plan_id, k.created_at,
           m.first_seen AS missing_since
    FROM keys k
    LEFT JOIN missing_keys m ON m.alias = k.alias
"#;

/// Entitlement store backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn register_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        referred_by: Option<i64>,
    ) -> StoreResult<User> {
        // A self-referral would credit the buyer with their own purchases
        let referred_by = referred_by.filter(|referrer| *referrer != user_id);

        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, referred_by, subscription_token)
            VALUES ($1, $2, (SELECT user_id FROM users WHERE user_id = $3), $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(referred_by)
        .bind(generate_subscription_token())
        .execute(&self.pool)
        .await?;

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(user)
    }

    async fn user(&self, user_id: i64) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    async fn user_by_token(&self, token: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE subscription_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    async fn try_begin_payment(&self, user_id: i64) -> StoreResult<bool> {
        // Compare-and-set: only one caller can see the row with the flag unset
        let claimed = sqlx::query(
            "UPDATE users SET pending_payment = TRUE WHERE user_id = $1 AND pending_payment = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(claimed == 1)
    }

    async fn finish_payment(&self, user_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE users SET pending_payment = FALSE WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn clear_all_pending_payments(&self) -> StoreResult<u64> {
        let cleared =
            sqlx::query("UPDATE users SET pending_payment = FALSE WHERE pending_payment = TRUE")
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(cleared)
    }

    async fn record_purchase(
        &self,
        user_id: i64,
        amount_cents: i64,
        months: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET total_spent_cents = total_spent_cents + $2,
                total_months = total_months + $3
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount_cents)
        .bind(months)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_referral_balance(&self, user_id: i64, amount_cents: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE users SET referral_balance_cents = referral_balance_cents + $2 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(amount_cents)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn hosts(&self, only_enabled: bool) -> StoreResult<Vec<Host>> {
        let hosts = sqlx::query_as::<_, Host>(
            "SELECT * FROM hosts WHERE is_enabled OR NOT $1 ORDER BY host_name",
        )
        .bind(only_enabled)
        .fetch_all(&self.pool)
        .await?;

        Ok(hosts)
    }

    async fn host(&self, host_name: &str) -> StoreResult<Option<Host>> {
        let host = sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE host_name = $1")
            .bind(host_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(host)
    }

    async fn upsert_host(&self, host: &Host) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hosts (host_name, host_url, host_username, host_password, inbound_id, is_enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (host_name) DO UPDATE SET
                host_url = EXCLUDED.host_url,
                host_username = EXCLUDED.host_username,
                host_password = EXCLUDED.host_password,
                inbound_id = EXCLUDED.inbound_id,
                is_enabled = EXCLUDED.is_enabled
            "#,
        )
        .bind(&host.host_name)
        .bind(&host.host_url)
        .bind(&host.host_username)
        .bind(&host.host_password)
        .bind(host.inbound_id)
        .bind(host.is_enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_host_enabled(&self, host_name: &str, enabled: bool) -> StoreResult<()> {
        sqlx::query("UPDATE hosts SET is_enabled = $2 WHERE host_name = $1")
            .bind(host_name)
            .bind(enabled)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn plan(&self, plan_id: i64) -> StoreResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(plan)
    }

    async fn global_plan_ids(&self) -> StoreResult<BTreeSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT plan_id FROM plans WHERE host_name = $1")
            .bind(GLOBAL_HOST)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids.into_iter().collect())
    }

    async fn create_plan(
        &self,
        host_name: &str,
        plan_name: &str,
        months: i32,
        price_cents: i64,
    ) -> StoreResult<Plan> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (host_name, plan_name, months, price_cents)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(host_name)
        .bind(plan_name)
        .bind(months)
        .bind(price_cents)
        .fetch_one(&self.pool)
        .await?;

        Ok(plan)
    }

    async fn keys_for_host(&self, host_name: &str) -> StoreResult<Vec<Key>> {
        let keys = sqlx::query_as::<_, Key>(&format!(
            "{KEY_SELECT} WHERE k.host_name = $1 ORDER BY k.key_id"
        ))
        .bind(host_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn keys_for_user(&self, user_id: i64) -> StoreResult<Vec<Key>> {
        let keys = sqlx::query_as::<_, Key>(&format!(
            "{KEY_SELECT} WHERE k.user_id = $1 ORDER BY k.key_id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn all_keys(&self) -> StoreResult<Vec<Key>> {
        let keys = sqlx::query_as::<_, Key>(&format!("{KEY_SELECT} ORDER BY k.key_id"))
            .fetch_all(&self.pool)
            .await?;

        Ok(keys)
    }

    async fn key(&self, key_id: i64) -> StoreResult<Option<Key>> {
        let key = sqlx::query_as::<_, Key>(&format!("{KEY_SELECT} WHERE k.key_id = $1"))
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(key)
    }

    async fn upsert_key(&self, key: &NewKey) -> StoreResult<Key> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO keys (user_id, host_name, client_id, alias, expires_at, connection_descriptor, plan_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (alias) DO UPDATE SET
                client_id = EXCLUDED.client_id,
                expires_at = GREATEST(keys.expires_at, EXCLUDED.expires_at),
                connection_descriptor = COALESCE(EXCLUDED.connection_descriptor, keys.connection_descriptor),
                plan_id = EXCLUDED.plan_id
            "#,
        )
        .bind(key.user_id)
        .bind(&key.host_name)
        .bind(&key.client_id)
        .bind(&key.alias)
        .bind(key.expires_at)
        .bind(&key.connection_descriptor)
        .bind(key.plan_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM missing_keys WHERE alias = $1")
            .bind(&key.alias)
            .execute(&mut *tx)
            .await?;

        let stored = sqlx::query_as::<_, Key>(&format!("{KEY_SELECT} WHERE k.alias = $1"))
            .bind(&key.alias)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(stored)
    }

    async fn sync_key_from_remote(
        &self,
        alias: &str,
        client_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE keys SET client_id = $2, expires_at = $3 WHERE alias = $1")
            .bind(alias)
            .bind(client_id)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM missing_keys WHERE alias = $1")
            .bind(alias)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn set_key_descriptor(&self, key_id: i64, descriptor: &str) -> StoreResult<()> {
        sqlx::query("UPDATE keys SET connection_descriptor = $2 WHERE key_id = $1")
            .bind(key_id)
            .bind(descriptor)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_key(&self, alias: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM missing_keys WHERE alias = $1")
            .bind(alias)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM keys WHERE alias = $1")
            .bind(alias)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(deleted > 0)
    }

    async fn mark_key_missing(
        &self,
        alias: &str,
        host_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO missing_keys (alias, host_name, first_seen)
            VALUES ($1, $2, $3)
            ON CONFLICT (alias) DO NOTHING
            "#,
        )
        .bind(alias)
        .bind(host_name)
        .bind(seen_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn clear_missing_marker(&self, alias: &str) -> StoreResult<bool> {
        let removed = sqlx::query("DELETE FROM missing_keys WHERE alias = $1")
            .bind(alias)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(removed > 0)
    }

    async fn sent_thresholds(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
    ) -> StoreResult<Vec<i32>> {
        let thresholds = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT threshold_hours FROM sent_notifications
            WHERE user_id = $1 AND key_id IS NOT DISTINCT FROM $2 AND kind = $3
            "#,
        )
        .bind(user_id)
        .bind(key_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(thresholds)
    }

    async fn record_notification(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
        threshold_hours: i32,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sent_notifications (user_id, key_id, kind, threshold_hours, sent_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(key_id)
        .bind(kind.as_str())
        .bind(threshold_hours)
        .bind(sent_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn forget_notifications(
        &self,
        user_id: i64,
        key_id: Option<i64>,
        kind: NotificationKind,
    ) -> StoreResult<u64> {
        let forgotten = sqlx::query(
            r#"
            DELETE FROM sent_notifications
            WHERE user_id = $1 AND key_id IS NOT DISTINCT FROM $2 AND kind = $3
            "#,
        )
        .bind(user_id)
        .bind(key_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(forgotten)
    }

    async fn prune_notifications(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let pruned = sqlx::query("DELETE FROM sent_notifications WHERE sent_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(pruned)
    }

    async fn is_webhook_processed(&self, provider: &str, external_id: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM processed_webhooks WHERE provider = $1 AND external_id = $2)",
        )
        .bind(provider)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_webhook_processed(
        &self,
        provider: &str,
        external_id: &str,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_webhooks (provider, external_id, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider, external_id) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(external_id)
        .bind(processed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn release_webhook(&self, provider: &str, external_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM processed_webhooks WHERE provider = $1 AND external_id = $2")
            .bind(provider)
            .bind(external_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn log_transaction(&self, transaction: &NewTransaction) -> StoreResult<Transaction> {
        let logged = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (
                transaction_id,
                user_id,
                status,
                amount_cents,
                payment_method,
                provider,
                external_id,
                plan_id,
                host_name,
                metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(transaction.user_id)
        .bind(transaction.status)
        .bind(transaction.amount_cents)
        .bind(&transaction.payment_method)
        .bind(&transaction.provider)
        .bind(&transaction.external_id)
        .bind(transaction.plan_id)
        .bind(&transaction.host_name)
        .bind(&transaction.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(logged)
    }

    async fn transactions_for_user(&self, user_id: i64) -> StoreResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar::<_, Option<String>>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.flatten())
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
