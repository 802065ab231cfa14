use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Invoice;
use crate::repository::traits::InvoiceRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresInvoiceRepository {
    pool: PgPool,
}

impl PostgresInvoiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceRepository for PostgresInvoiceRepository {
    async fn create(&self, invoice: &Invoice) -> Result<Invoice> {
        let created = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices
                (account_id, subscription_id, number, status, amount_due, amount_paid,
                 tax, currency, due_date, line_items, period_start, period_end, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(invoice.account_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.number)
        .bind(invoice.status)
        .bind(invoice.amount_due)
        .bind(invoice.amount_paid)
        .bind(invoice.tax)
        .bind(&invoice.currency)
        .bind(invoice.due_date)
        .bind(&invoice.line_items)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(&invoice.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(invoice)
    }

    async fn find_for_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE subscription_id = $1 AND period_start = $2 AND status != 'void'
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn update(&self, invoice: &Invoice) -> Result<Invoice> {
        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices SET
                status = $1, amount_due = $2, amount_paid = $3, tax = $4,
                paid_at = $5, voided_at = $6, line_items = $7, metadata = $8,
                updated_at = NOW()
            WHERE id = $9
            RETURNING *
            "#,
        )
        .bind(invoice.status)
        .bind(invoice.amount_due)
        .bind(invoice.amount_paid)
        .bind(invoice.tax)
        .bind(invoice.paid_at)
        .bind(invoice.voided_at)
        .bind(&invoice.line_items)
        .bind(&invoice.metadata)
        .bind(invoice.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn list_open_or_past_due(&self, account_id: Uuid) -> Result<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE account_id = $1 AND status IN ('open', 'past_due')
            ORDER BY due_date ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    async fn overdue(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE status = 'open' AND due_date < $1
            ORDER BY due_date ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    async fn dunning_candidates(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE status IN ('open', 'past_due') AND due_date < $1
            ORDER BY due_date ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    async fn recently_closed(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE status IN ('paid', 'void') AND period_end >= $1 AND period_end <= NOW()
            ORDER BY period_end ASC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    /// Serializes on the singleton `invoice_counter` row (concurrency fence
    /// #3) rather than a Postgres `SEQUENCE`, matching the counter-row
    /// contract this schema was built around.
    async fn next_invoice_number(&self) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let (next,): (i64,) = sqlx::query_as(
            "SELECT next_value FROM invoice_counter WHERE id = 1 FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE invoice_counter SET next_value = $1 WHERE id = 1")
            .bind(next + 1)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn total_collected(&self) -> Result<i64> {
        let (total,): (Option<i64>,) =
            sqlx::query_as("SELECT SUM(amount_paid) FROM invoices WHERE status = 'paid'")
                .fetch_one(&self.pool)
                .await?;
        Ok(total.unwrap_or(0))
    }
}
