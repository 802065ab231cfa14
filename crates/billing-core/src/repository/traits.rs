use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::*;
use crate::Result;

#[async_trait]
pub trait AccountRepository: Send + Sync + 'static {
    async fn create(&self, request: CreateAccountRequest) -> Result<Account>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;
    async fn update_status(&self, id: Uuid, status: AccountStatus) -> Result<Account>;
    async fn list(&self, pagination: &Pagination) -> Result<Vec<Account>>;
}

#[async_trait]
pub trait PaymentMethodRepository: Send + Sync + 'static {
    async fn create(&self, method: &PaymentMethod) -> Result<PaymentMethod>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>>;
    async fn find_default(&self, account_id: Uuid) -> Result<Option<PaymentMethod>>;
    async fn list_by_account(&self, account_id: Uuid) -> Result<Vec<PaymentMethod>>;
    /// Clears any existing default for the account and sets this one, in a
    /// single transaction (the partial unique index is the final fence).
    async fn set_default(&self, account_id: Uuid, payment_method_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync + 'static {
    async fn create(&self, plan: &Plan) -> Result<Plan>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>>;
    async fn list_active(&self) -> Result<Vec<Plan>>;
    async fn deactivate(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync + 'static {
    async fn create(&self, subscription: &Subscription) -> Result<Subscription>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>>;
    async fn update(&self, subscription: &Subscription) -> Result<Subscription>;
    async fn list_by_account(&self, account_id: Uuid) -> Result<Vec<Subscription>>;
    async fn due_for_billing(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>>;
    async fn trialing_expired(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>>;
    async fn pending_plan_change_due(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>>;
    async fn paused_resumable(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>>;
    async fn paused_stale(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>>;
    async fn billable_count(&self) -> Result<Vec<(Uuid, i64)>>;
    /// Count of subscriptions that transitioned to `cancelled` within
    /// `[since, now)`, for the daily churn rollup.
    async fn churned_since(&self, since: DateTime<Utc>) -> Result<i64>;
    /// Distinct accounts currently holding a non-cancelled subscription,
    /// for the daily LTV rollup's denominator.
    async fn active_account_count(&self) -> Result<i64>;
    async fn append_history(&self, entry: &SubscriptionHistory) -> Result<()>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync + 'static {
    async fn create(&self, invoice: &Invoice) -> Result<Invoice>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Invoice>>;
    async fn find_for_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> Result<Option<Invoice>>;
    async fn update(&self, invoice: &Invoice) -> Result<Invoice>;
    async fn list_open_or_past_due(&self, account_id: Uuid) -> Result<Vec<Invoice>>;
    async fn overdue(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>>;
    /// Candidates for the dunning sweep: status in {open, past_due} and
    /// already overdue. Broader than `overdue`, which only tracks the
    /// open-to-past_due transition itself.
    async fn dunning_candidates(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>>;
    /// Settled (paid or void) invoices whose period closed within
    /// `[since, now)`, for the late-usage reconciliation sweep (§4.7).
    async fn recently_closed(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>>;
    async fn next_invoice_number(&self) -> Result<i64>;
    /// Total amount collected across every paid invoice, for the LTV
    /// rollup's numerator.
    async fn total_collected(&self) -> Result<i64>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync + 'static {
    async fn create(&self, payment: &Payment) -> Result<Payment>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>>;
    async fn update(&self, payment: &Payment) -> Result<Payment>;
    async fn due_for_retry(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>>;
}

#[async_trait]
pub trait CreditRepository: Send + Sync + 'static {
    async fn create(&self, credit: &Credit) -> Result<Credit>;
    async fn update(&self, credit: &Credit) -> Result<Credit>;
    async fn available(&self, account_id: Uuid, currency: &str, now: DateTime<Utc>) -> Result<Vec<Credit>>;
}

#[async_trait]
pub trait UsageRecordRepository: Send + Sync + 'static {
    async fn create(&self, record: &UsageRecord) -> Result<UsageRecord>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<UsageRecord>>;
    /// Distinct metric names recorded for the subscription within the
    /// window, so the Invoice Assembler knows which metrics to price
    /// without having to know them up front.
    async fn distinct_metrics(
        &self,
        subscription_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>>;
    async fn aggregate(
        &self,
        subscription_id: Uuid,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;
    async fn late_for_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>>;
}

#[async_trait]
pub trait WebhookEndpointRepository: Send + Sync + 'static {
    async fn create(&self, endpoint: &WebhookEndpoint) -> Result<WebhookEndpoint>;
    async fn list_active(&self) -> Result<Vec<WebhookEndpoint>>;
}

#[async_trait]
pub trait WebhookEventRepository: Send + Sync + 'static {
    async fn create(&self, event: &WebhookEvent) -> Result<WebhookEvent>;
    async fn update(&self, event: &WebhookEvent) -> Result<WebhookEvent>;
    async fn pending_delivery(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookEvent>>;
}

#[async_trait]
pub trait AnalyticsRepository: Send + Sync + 'static {
    async fn upsert(&self, snapshot: &AnalyticsSnapshot) -> Result<()>;
}
