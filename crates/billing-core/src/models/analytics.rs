use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalyticsSnapshot {
    pub metric_name: String,
    pub period: NaiveDate,
    pub value: i64,
    pub metadata: serde_json::Value,
}

pub mod metric {
    pub const MRR: &str = "mrr";
    pub const CHURN_COUNT: &str = "churn_count";
    pub const LTV: &str = "ltv";
}
