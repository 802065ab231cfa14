use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::{CurrencyCode, Entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_status", rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Warning,
    Blocked,
}

impl Default for AccountStatus {
    fn default() -> Self {
        AccountStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub currency: CurrencyCode,
    pub timezone: String,
    pub tax_exempt: bool,
    pub tax_id: Option<String>,
    pub vat_id: Option<String>,
    pub status: AccountStatus,
    pub deleted_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Account {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Account {
    pub fn is_blocked(&self) -> bool {
        self.status == AccountStatus::Blocked
    }

    /// A reverse-charge applies when the account supplies a VAT id and is
    /// not itself tax-exempt for some other reason; the oracle is still
    /// the source of truth for validity, this is just the "skip tax" gate.
    pub fn has_reverse_charge_vat(&self) -> bool {
        self.vat_id.as_ref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateAccountRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(equal = 3))]
    pub currency: CurrencyCode,
    pub timezone: Option<String>,
    pub tax_exempt: bool,
    pub tax_id: Option<String>,
    pub vat_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: Uuid::new_v4(),
            email: "a@example.com".into(),
            name: "Acme".into(),
            currency: "USD".into(),
            timezone: "UTC".into(),
            tax_exempt: false,
            tax_id: None,
            vat_id: None,
            status: AccountStatus::Active,
            deleted_at: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn blocked_status_detected() {
        let mut a = account();
        assert!(!a.is_blocked());
        a.status = AccountStatus::Blocked;
        assert!(a.is_blocked());
    }

    #[test]
    fn reverse_charge_requires_non_empty_vat_id() {
        let mut a = account();
        assert!(!a.has_reverse_charge_vat());
        a.vat_id = Some("".into());
        assert!(!a.has_reverse_charge_vat());
        a.vat_id = Some("IE1234567T".into());
        assert!(a.has_reverse_charge_vat());
    }
}
