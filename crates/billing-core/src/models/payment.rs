use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{CurrencyCode, Entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: i64,
    pub currency: CurrencyCode,
    pub status: PaymentStatus,
    pub gateway_txn_id: Option<String>,
    pub payment_method_id: Option<Uuid>,
    pub failure_message: Option<String>,
    pub idempotency_key: String,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Payment {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Day offsets from the first failure, per the fixed retry schedule.
pub const RETRY_SCHEDULE_DAYS: [i64; 4] = [3, 5, 7, 10];

impl Payment {
    pub fn can_retry(&self) -> bool {
        self.status == PaymentStatus::Failed
            && (self.retry_count as usize) < RETRY_SCHEDULE_DAYS.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(retry_count: i32) -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            amount: 1000,
            currency: "USD".into(),
            status: PaymentStatus::Failed,
            gateway_txn_id: None,
            payment_method_id: None,
            failure_message: Some("card_declined".into()),
            idempotency_key: "key".into(),
            retry_count,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn retry_exhausted_after_schedule_length() {
        assert!(payment(0).can_retry());
        assert!(payment(3).can_retry());
        assert!(!payment(4).can_retry());
    }
}
