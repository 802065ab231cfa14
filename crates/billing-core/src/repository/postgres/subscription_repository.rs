use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Subscription, SubscriptionHistory};
use crate::repository::traits::SubscriptionRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn create(&self, subscription: &Subscription) -> Result<Subscription> {
        let created = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (account_id, plan_id, status, quantity, current_period_start,
                 current_period_end, cancel_at_period_end, trial_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(subscription.account_id)
        .bind(subscription.plan_id)
        .bind(subscription.status)
        .bind(subscription.quantity)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.trial_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>> {
        let subscription =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(subscription)
    }

    async fn update(&self, subscription: &Subscription) -> Result<Subscription> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET
                plan_id = $1, pending_plan_id = $2, status = $3, quantity = $4,
                current_period_start = $5, current_period_end = $6,
                cancel_at_period_end = $7, cancelled_at = $8, trial_end = $9,
                pause_resumes_at = $10, paused_at = $11, updated_at = NOW()
            WHERE id = $12
            RETURNING *
            "#,
        )
        .bind(subscription.plan_id)
        .bind(subscription.pending_plan_id)
        .bind(subscription.status)
        .bind(subscription.quantity)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.cancelled_at)
        .bind(subscription.trial_end)
        .bind(subscription.pause_resumes_at)
        .bind(subscription.paused_at)
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn list_by_account(&self, account_id: Uuid) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    async fn due_for_billing(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE current_period_end <= $1
              AND status IN ('active', 'past_due')
              AND NOT cancel_at_period_end
            ORDER BY current_period_end ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    async fn trialing_expired(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'trialing' AND trial_end <= $1
            ORDER BY trial_end ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    async fn pending_plan_change_due(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE pending_plan_id IS NOT NULL AND current_period_end <= $1
            ORDER BY current_period_end ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    async fn paused_resumable(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'paused' AND pause_resumes_at <= $1
            ORDER BY pause_resumes_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    async fn paused_stale(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'paused' AND paused_at <= $1
            ORDER BY paused_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    async fn billable_count(&self) -> Result<Vec<(Uuid, i64)>> {
        // (plan_id, total quantity) for every billable subscription on that
        // plan; the analytics rollup multiplies by plan.amount itself.
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT plan_id, SUM(quantity)::bigint
            FROM subscriptions
            WHERE status IN ('active', 'past_due')
            GROUP BY plan_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn churned_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscriptions WHERE status = 'cancelled' AND cancelled_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn active_account_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT account_id) FROM subscriptions WHERE status IN ('trialing', 'active', 'past_due', 'paused')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn append_history(&self, entry: &SubscriptionHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history
                (subscription_id, event_type, old_value, new_value, reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.subscription_id)
        .bind(&entry.event_type)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(&entry.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
