//! Domain services (§4). Each is generic over the repository traits it
//! needs, owning its fake or Postgres implementors by value, so it can be
//! unit-tested without a database.

pub mod credit_manager;
pub mod dunning_controller;
pub mod invoice_assembler;
pub mod payment_orchestrator;
pub mod pricing_engine;
pub mod subscription_engine;
pub mod usage_recorder;
pub mod webhook_dispatcher;

pub use credit_manager::CreditManager;
pub use dunning_controller::DunningController;
pub use invoice_assembler::InvoiceAssembler;
pub use payment_orchestrator::PaymentOrchestrator;
pub use subscription_engine::SubscriptionEngine;
pub use usage_recorder::UsageRecorder;
pub use webhook_dispatcher::WebhookDispatcher;
