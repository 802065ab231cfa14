use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::PaymentMethod;
use crate::repository::traits::PaymentMethodRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresPaymentMethodRepository {
    pool: PgPool,
}

impl PostgresPaymentMethodRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentMethodRepository for PostgresPaymentMethodRepository {
    async fn create(&self, method: &PaymentMethod) -> Result<PaymentMethod> {
        let created = sqlx::query_as::<_, PaymentMethod>(
            r#"
            INSERT INTO payment_methods
                (account_id, gateway_token, brand, last4, exp_month, exp_year, is_default)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(method.account_id)
        .bind(&method.gateway_token)
        .bind(&method.brand)
        .bind(&method.last4)
        .bind(method.exp_month)
        .bind(method.exp_year)
        .bind(method.is_default)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>> {
        let method = sqlx::query_as::<_, PaymentMethod>("SELECT * FROM payment_methods WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(method)
    }

    async fn find_default(&self, account_id: Uuid) -> Result<Option<PaymentMethod>> {
        let method = sqlx::query_as::<_, PaymentMethod>(
            "SELECT * FROM payment_methods WHERE account_id = $1 AND is_default",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(method)
    }

    async fn list_by_account(&self, account_id: Uuid) -> Result<Vec<PaymentMethod>> {
        let methods = sqlx::query_as::<_, PaymentMethod>(
            "SELECT * FROM payment_methods WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(methods)
    }

    async fn set_default(&self, account_id: Uuid, payment_method_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE payment_methods SET is_default = TRUE WHERE id = $1 AND account_id = $2",
        )
        .bind(payment_method_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
