use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::Entity;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub metric: String,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: String,
    pub received_at: DateTime<Utc>,
}

impl Entity for UsageRecord {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

impl UsageRecord {
    /// A record is "late" when it arrives after the period it belongs to
    /// has already been billed, i.e. its event timestamp falls before the
    /// invoiced period's end but it was only received after that period
    /// closed.
    pub fn is_late_for(&self, billed_period_end: DateTime<Utc>) -> bool {
        self.timestamp < billed_period_end && self.received_at >= billed_period_end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RecordUsageRequest {
    pub subscription_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub metric: String,
    #[validate(range(min = 1))]
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: String,
}
