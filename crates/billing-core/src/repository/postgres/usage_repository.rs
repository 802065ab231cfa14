use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::UsageRecord;
use crate::repository::traits::UsageRecordRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresUsageRecordRepository {
    pool: PgPool,
}

impl PostgresUsageRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageRecordRepository for PostgresUsageRecordRepository {
    async fn create(&self, record: &UsageRecord) -> Result<UsageRecord> {
        let created = sqlx::query_as::<_, UsageRecord>(
            r#"
            INSERT INTO usage_records (subscription_id, metric, quantity, timestamp, idempotency_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(record.subscription_id)
        .bind(&record.metric)
        .bind(record.quantity)
        .bind(record.timestamp)
        .bind(&record.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(record) => Ok(record),
            None => self
                .find_by_idempotency_key(&record.idempotency_key)
                .await?
                .ok_or_else(|| crate::Error::internal("usage insert raced but no row found")),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<UsageRecord>> {
        let record = sqlx::query_as::<_, UsageRecord>(
            "SELECT * FROM usage_records WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn distinct_metrics(
        &self,
        subscription_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let metrics: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT metric FROM usage_records
            WHERE subscription_id = $1 AND timestamp >= $2 AND timestamp < $3
            "#,
        )
        .bind(subscription_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(metrics)
    }

    async fn aggregate(
        &self,
        subscription_id: Uuid,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(quantity) FROM usage_records
            WHERE subscription_id = $1 AND metric = $2
              AND timestamp >= $3 AND timestamp < $4
            "#,
        )
        .bind(subscription_id)
        .bind(metric)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0))
    }

    async fn late_for_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT * FROM usage_records
            WHERE subscription_id = $1
              AND timestamp >= $2 AND timestamp < $3
              AND received_at > $3
            ORDER BY timestamp ASC
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
