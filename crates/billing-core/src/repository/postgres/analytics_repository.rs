use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::AnalyticsSnapshot;
use crate::repository::traits::AnalyticsRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresAnalyticsRepository {
    pool: PgPool,
}

impl PostgresAnalyticsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalyticsRepository for PostgresAnalyticsRepository {
    async fn upsert(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics_snapshots (metric_name, period, value, metadata, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (metric_name, period)
            DO UPDATE SET value = EXCLUDED.value, metadata = EXCLUDED.metadata, updated_at = NOW()
            "#,
        )
        .bind(&snapshot.metric_name)
        .bind(snapshot.period)
        .bind(snapshot.value)
        .bind(&snapshot.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
