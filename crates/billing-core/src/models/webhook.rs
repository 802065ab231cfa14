use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "webhook_status", rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

/// A subscriber endpoint. Re-architected as a store-backed entity: the
/// source kept these in a process-local map, which does not survive a
/// restart or work across multiple worker processes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub url: String,
    /// Event-type patterns this endpoint subscribes to, e.g.
    /// `["invoice.*", "payment.succeeded"]`; `"*"` matches everything.
    pub events: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn event_patterns(&self) -> crate::Result<Vec<String>> {
        Ok(serde_json::from_value(self.events.clone())?)
    }

    pub fn matches(&self, event_type: &str) -> bool {
        let Ok(patterns) = self.event_patterns() else {
            return false;
        };
        patterns.iter().any(|pattern| {
            if pattern == "*" {
                true
            } else if let Some(prefix) = pattern.strip_suffix(".*") {
                event_type.starts_with(prefix)
            } else {
                pattern == event_type
            }
        })
    }
}

/// Backoff schedule in minutes, applied after each delivery failure.
pub const WEBHOOK_RETRY_SCHEDULE_MINUTES: [i64; 5] = [3, 6, 12, 24, 48];

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub endpoint_url: String,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Entity for WebhookEvent {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl WebhookEvent {
    pub fn can_retry(&self) -> bool {
        self.status == WebhookStatus::Failed
            && (self.retry_count as usize) < WEBHOOK_RETRY_SCHEDULE_MINUTES.len()
    }
}
