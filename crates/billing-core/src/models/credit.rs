use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{CurrencyCode, Entity};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Credit {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    pub currency: CurrencyCode,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub applied_to_invoice_id: Option<Uuid>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Credit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Credit {
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.applied_to_invoice_id.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credit(expires_at: Option<DateTime<Utc>>, applied: bool) -> Credit {
        let now = Utc::now();
        Credit {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            amount: 500,
            currency: "USD".into(),
            reason: "void-refund".into(),
            expires_at,
            applied_to_invoice_id: applied.then(Uuid::new_v4),
            applied_at: None,
            created_at: now,
        }
    }

    #[test]
    fn expired_and_applied_credits_are_unavailable() {
        let now = Utc::now();
        assert!(credit(None, false).is_available(now));
        assert!(!credit(None, true).is_available(now));
        assert!(!credit(Some(now - Duration::days(1)), false).is_available(now));
        assert!(credit(Some(now + Duration::days(1)), false).is_available(now));
    }
}
