pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod notification;
pub mod repository;
pub mod services;
pub mod tax;

pub use config::Config;
pub use db::migrate::Migrator;
pub use db::create_pool;
pub use error::{Error, Result};
pub use gateway::{GatewayOutcome, MockPaymentGateway, PaymentGateway};
pub use notification::{LoggingNotificationSink, NotificationKind, NotificationSink};
pub use tax::{FlatRateTaxOracle, TaxExemptReason, TaxOracle, TaxResult};

pub use services::{
    CreditManager, DunningController, InvoiceAssembler, PaymentOrchestrator, SubscriptionEngine,
    UsageRecorder, WebhookDispatcher,
};
pub use services::pricing_engine;

/// Current version of the billing engine crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_creation() {
        let err = Error::validation("Test validation error");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "validation");
    }
}
