use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod account;
pub mod analytics;
pub mod credit;
pub mod invoice;
pub mod payment;
pub mod payment_method;
pub mod plan;
pub mod subscription;
pub mod usage;
pub mod webhook;

pub use account::*;
pub use analytics::*;
pub use credit::*;
pub use invoice::*;
pub use payment::*;
pub use payment_method::*;
pub use plan::*;
pub use subscription::*;
pub use usage::*;
pub use webhook::*;

/// Common trait for root aggregates.
pub trait Entity: Send + Sync {
    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
}

/// ISO-4217 currency code. Stored and compared as the raw 3-letter code
/// rather than a closed enum: the engine never converts between
/// currencies (§1 Non-goals), so there is no behavioural difference
/// between a known and an unknown code beyond what the oracle/gateway
/// adapters care about.
pub type CurrencyCode = String;

/// Pagination parameters shared by list operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }

    pub fn limit(&self) -> i64 {
        self.per_page
    }
}
