use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::Credit;
use crate::repository::traits::CreditRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresCreditRepository {
    pool: PgPool,
}

impl PostgresCreditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditRepository for PostgresCreditRepository {
    async fn create(&self, credit: &Credit) -> Result<Credit> {
        let created = sqlx::query_as::<_, Credit>(
            r#"
            INSERT INTO credits (account_id, amount, currency, reason, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(credit.account_id)
        .bind(credit.amount)
        .bind(&credit.currency)
        .bind(&credit.reason)
        .bind(credit.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn update(&self, credit: &Credit) -> Result<Credit> {
        let updated = sqlx::query_as::<_, Credit>(
            r#"
            UPDATE credits SET
                amount = $1, applied_to_invoice_id = $2, applied_at = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(credit.amount)
        .bind(credit.applied_to_invoice_id)
        .bind(credit.applied_at)
        .bind(credit.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn available(
        &self,
        account_id: uuid::Uuid,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Credit>> {
        let credits = sqlx::query_as::<_, Credit>(
            r#"
            SELECT * FROM credits
            WHERE account_id = $1 AND currency = $2
              AND applied_to_invoice_id IS NULL
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY created_at ASC
            "#,
        )
        .bind(account_id)
        .bind(currency)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(credits)
    }
}
