//! Repository layer: one trait per aggregate, backed by a Postgres
//! implementation. Services are generic over these traits so tests can
//! swap in in-memory fakes.

pub mod postgres;
pub mod traits;

pub use traits::{
    AccountRepository, AnalyticsRepository, CreditRepository, InvoiceRepository,
    PaymentMethodRepository, PaymentRepository, PlanRepository, SubscriptionRepository,
    UsageRecordRepository, WebhookEndpointRepository, WebhookEventRepository,
};

pub use postgres::{
    PostgresAccountRepository, PostgresAnalyticsRepository, PostgresCreditRepository,
    PostgresInvoiceRepository, PostgresPaymentMethodRepository, PostgresPaymentRepository,
    PostgresPlanRepository, PostgresSubscriptionRepository, PostgresUsageRecordRepository,
    PostgresWebhookEndpointRepository, PostgresWebhookEventRepository,
};
