//! Schema migration runner.
//!
//! Tracks applied migrations in `_migrations` and replays the SQL files
//! under `migrations/` that haven't run yet. Schema migration *management*
//! (a CLI for authoring new migration files, rollback tooling, etc.) is out
//! of scope — this just applies the fixed set baked into the binary.

use sqlx::PgPool;
use tracing::{info, warn};

use crate::{Error, Result};

pub struct Migration {
    pub version: i64,
    pub name: String,
}

pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM _migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    async fn record(&self, version: i64, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(version)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    /// Apply every migration newer than the highest recorded version.
    pub async fn migrate(&self) -> Result<()> {
        info!("initializing migration tracking");
        self.init_migration_table().await?;

        let applied = self.applied_versions().await?;

        let migrations: Vec<(i64, &str, &str)> = vec![
            (1, "accounts_and_payment_methods", include_str!("../../migrations/001_accounts_and_payment_methods.sql")),
            (2, "plans_and_subscriptions", include_str!("../../migrations/002_plans_and_subscriptions.sql")),
            (3, "invoices_and_payments", include_str!("../../migrations/003_invoices_and_payments.sql")),
            (4, "usage_and_credits", include_str!("../../migrations/004_usage_and_credits.sql")),
            (5, "webhooks_and_analytics", include_str!("../../migrations/005_webhooks_and_analytics.sql")),
        ];

        for (version, name, sql) in migrations {
            if applied.contains(&version) {
                continue;
            }

            info!(version, name, "applying migration");
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    warn!(version, error = %e, "migration failed");
                    Error::Database(e)
                })?;

            self.record(version, name).await?;
        }

        info!("migrations up to date");
        Ok(())
    }
}
