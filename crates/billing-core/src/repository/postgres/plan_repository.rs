use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Plan;
use crate::repository::traits::PlanRepository;
use crate::Result;

#[derive(Clone)]
pub struct PostgresPlanRepository {
    pool: PgPool,
}

impl PostgresPlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanRepository for PostgresPlanRepository {
    async fn create(&self, plan: &Plan) -> Result<Plan> {
        let created = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans
                (name, interval, amount, currency, trial_days, usage_type, tiers, active, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&plan.name)
        .bind(plan.interval)
        .bind(plan.amount)
        .bind(&plan.currency)
        .bind(plan.trial_days)
        .bind(plan.usage_type)
        .bind(&plan.tiers)
        .bind(plan.active)
        .bind(plan.version)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    async fn list_active(&self) -> Result<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE active ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    async fn deactivate(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE plans SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
