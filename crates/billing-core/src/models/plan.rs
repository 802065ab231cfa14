use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::CurrencyCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "plan_interval", rename_all = "snake_case")]
pub enum PlanInterval {
    Month,
    Year,
}

impl PlanInterval {
    /// Calendar-day approximation used throughout the engine: 30 days per
    /// month, 365 per year. This is deliberate, not a placeholder — see
    /// the open question recorded in DESIGN.md.
    pub fn approximate_days(&self) -> i64 {
        match self {
            PlanInterval::Month => 30,
            PlanInterval::Year => 365,
        }
    }
}

/// `"tiered"` is accepted purely as a configuration alias of `Graduated`
/// (serde alias), per the open question on volume/graduated/tiered
/// naming — the engine only ever matches on `Graduated` or `Volume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "usage_type", rename_all = "snake_case")]
pub enum UsageType {
    #[serde(alias = "tiered")]
    Graduated,
    Volume,
}

/// One entry of an ordered tier list. `up_to = None` means "infinity" and
/// must be the last entry after sorting ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTier {
    pub up_to: Option<i64>,
    pub unit_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub interval: PlanInterval,
    /// Amount per unit per period, in integer minor units.
    pub amount: i64,
    pub currency: CurrencyCode,
    pub trial_days: i32,
    pub usage_type: Option<UsageType>,
    /// Stored as JSONB; deserialized into `Vec<PlanTier>` by callers via
    /// `tiers()` rather than exposed as a raw `serde_json::Value` field.
    pub tiers: Option<serde_json::Value>,
    pub active: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn tiers(&self) -> crate::Result<Vec<PlanTier>> {
        match &self.tiers {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_and_year_approximate_days() {
        assert_eq!(PlanInterval::Month.approximate_days(), 30);
        assert_eq!(PlanInterval::Year.approximate_days(), 365);
    }
}
