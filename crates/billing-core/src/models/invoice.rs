use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{CurrencyCode, Entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    PastDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemType {
    Subscription,
    Usage,
    ProrationCredit,
    ProrationCharge,
    LateUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub amount: i64,
    pub quantity: i64,
    #[serde(rename = "type")]
    pub kind: LineItemType,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub number: String,
    pub status: InvoiceStatus,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub tax: i64,
    pub currency: CurrencyCode,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub line_items: serde_json::Value,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Invoice {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Invoice {
    pub fn line_items(&self) -> crate::Result<Vec<LineItem>> {
        Ok(serde_json::from_value(self.line_items.clone())?)
    }

    pub fn balance_due(&self) -> i64 {
        self.amount_due - self.amount_paid
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, InvoiceStatus::Paid | InvoiceStatus::Void)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == InvoiceStatus::Open && now > self.due_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_due_subtracts_paid_amount() {
        let items = vec![LineItem {
            description: "plan".into(),
            amount: 1000,
            quantity: 1,
            kind: LineItemType::Subscription,
        }];
        let invoice = Invoice {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            subscription_id: None,
            number: "INV-000001".into(),
            status: InvoiceStatus::Open,
            amount_due: 1000,
            amount_paid: 400,
            tax: 0,
            currency: "USD".into(),
            due_date: Utc::now(),
            paid_at: None,
            voided_at: None,
            line_items: serde_json::to_value(&items).unwrap(),
            period_start: None,
            period_end: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(invoice.balance_due(), 600);
        assert_eq!(invoice.line_items().unwrap().len(), 1);
    }
}
