use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{WebhookEndpoint, WebhookEvent};
use crate::repository::traits::{WebhookEndpointRepository, WebhookEventRepository};
use crate::Result;

#[derive(Clone)]
pub struct PostgresWebhookEndpointRepository {
    pool: PgPool,
}

impl PostgresWebhookEndpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEndpointRepository for PostgresWebhookEndpointRepository {
    async fn create(&self, endpoint: &WebhookEndpoint) -> Result<WebhookEndpoint> {
        let created = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            INSERT INTO webhook_endpoints (account_id, url, events, active)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(endpoint.account_id)
        .bind(&endpoint.url)
        .bind(&endpoint.events)
        .bind(endpoint.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn list_active(&self) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE active",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(endpoints)
    }
}

#[derive(Clone)]
pub struct PostgresWebhookEventRepository {
    pool: PgPool,
}

impl PostgresWebhookEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventRepository for PostgresWebhookEventRepository {
    async fn create(&self, event: &WebhookEvent) -> Result<WebhookEvent> {
        let created = sqlx::query_as::<_, WebhookEvent>(
            r#"
            INSERT INTO webhook_events (event_type, payload, endpoint_url, status)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.endpoint_url)
        .bind(event.status)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn update(&self, event: &WebhookEvent) -> Result<WebhookEvent> {
        let updated = sqlx::query_as::<_, WebhookEvent>(
            r#"
            UPDATE webhook_events SET
                status = $1, retry_count = $2, next_retry_at = $3,
                last_error = $4, delivered_at = $5
            WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(event.status)
        .bind(event.retry_count)
        .bind(event.next_retry_at)
        .bind(&event.last_error)
        .bind(event.delivered_at)
        .bind(event.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn pending_delivery(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT * FROM webhook_events
            WHERE status = 'pending'
              AND (retry_count = 0 OR next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
