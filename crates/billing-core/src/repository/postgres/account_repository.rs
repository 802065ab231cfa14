use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Account, AccountStatus, CreateAccountRequest, Pagination};
use crate::repository::traits::AccountRepository;
use crate::{Error, Result};

#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn create(&self, request: CreateAccountRequest) -> Result<Account> {
        request.validate().map_err(|e| Error::validation(e.to_string()))?;

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (email, name, currency, timezone, tax_exempt, tax_id, vat_id)
            VALUES ($1, $2, $3, COALESCE($4, 'UTC'), $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(request.email)
        .bind(request.name)
        .bind(request.currency)
        .bind(request.timezone)
        .bind(request.tax_exempt)
        .bind(request.tax_id)
        .bind(request.vat_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(account)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn update_status(&self, id: Uuid, status: AccountStatus) -> Result<Account> {
        let account = sqlx::query_as::<_, Account>(
            "UPDATE accounts SET status = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(status)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(account)
    }

    async fn list(&self, pagination: &Pagination) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(pagination.limit())
        .bind(pagination.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }
}
