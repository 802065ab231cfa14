use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Payment;
use crate::repository::traits::PaymentRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn create(&self, payment: &Payment) -> Result<Payment> {
        let created = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments
                (invoice_id, amount, currency, status, payment_method_id, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(payment.invoice_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(payment.payment_method_id)
        .bind(&payment.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(payment) => Ok(payment),
            None => self
                .find_by_idempotency_key(&payment.idempotency_key)
                .await?
                .ok_or_else(|| crate::Error::internal("payment insert raced but no row found")),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn update(&self, payment: &Payment) -> Result<Payment> {
        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET
                status = $1, gateway_txn_id = $2, failure_message = $3,
                retry_count = $4, next_retry_at = $5, updated_at = NOW()
            WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(payment.status)
        .bind(&payment.gateway_txn_id)
        .bind(&payment.failure_message)
        .bind(payment.retry_count)
        .bind(payment.next_retry_at)
        .bind(payment.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn due_for_retry(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }
}
