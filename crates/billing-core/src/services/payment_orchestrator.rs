//! Payment Orchestrator (§4.4).

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::gateway::{GatewayOutcome, PaymentGateway};
use crate::models::{
    Invoice, InvoiceStatus, Payment, PaymentMethod, PaymentStatus, SubscriptionStatus,
    RETRY_SCHEDULE_DAYS,
};
use crate::repository::{
    AccountRepository, InvoiceRepository, PaymentRepository, SubscriptionRepository,
    WebhookEndpointRepository, WebhookEventRepository,
};
use crate::services::dunning_controller;
use crate::services::webhook_dispatcher::enqueue_event;
use crate::{Error, Result};

pub struct PaymentOrchestrator<P, I, A, S, EP, EV, G> {
    payments: P,
    invoices: I,
    accounts: A,
    subscriptions: S,
    endpoints: EP,
    events: EV,
    gateway: G,
}

impl<P, I, A, S, EP, EV, G> PaymentOrchestrator<P, I, A, S, EP, EV, G>
where
    P: PaymentRepository,
    I: InvoiceRepository,
    A: AccountRepository,
    S: SubscriptionRepository,
    EP: WebhookEndpointRepository,
    EV: WebhookEventRepository,
    G: PaymentGateway,
{
    pub fn new(payments: P, invoices: I, accounts: A, subscriptions: S, endpoints: EP, events: EV, gateway: G) -> Self {
        Self {
            payments,
            invoices,
            accounts,
            subscriptions,
            endpoints,
            events,
            gateway,
        }
    }

    /// Creates and attempts a payment against `invoice` for its current
    /// balance due. If `idempotency_key` names an existing payment, that
    /// payment is returned unchanged with no gateway call (§4.4 step 1).
    pub async fn attempt(
        &self,
        invoice: &Invoice,
        payment_method: &PaymentMethod,
        idempotency_key: Option<String>,
    ) -> Result<Payment> {
        let key = idempotency_key
            .unwrap_or_else(|| format!("payment_{}_{}", invoice.id, Uuid::new_v4()));

        if let Some(existing) = self.payments.find_by_idempotency_key(&key).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            invoice_id: invoice.id,
            amount: invoice.balance_due(),
            currency: invoice.currency.clone(),
            status: PaymentStatus::Pending,
            gateway_txn_id: None,
            payment_method_id: Some(payment_method.id),
            failure_message: None,
            idempotency_key: key.clone(),
            retry_count: 0,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        };
        // The repository's unique constraint on idempotency_key is the
        // concurrency fence: a concurrent insert with the same key loses
        // the race and is refetched rather than erroring.
        let created = self.payments.create(&payment).await?;
        if created.status != PaymentStatus::Pending {
            // Another caller already resolved this attempt.
            return Ok(created);
        }

        self.run_gateway(created, payment_method, &key).await
    }

    /// Re-attempts a payment that is due for retry, using the same
    /// idempotency key (so the gateway's at-most-one-charge guarantee
    /// still holds even if the previous attempt secretly succeeded).
    pub async fn retry(&self, payment_id: Uuid, payment_method: &PaymentMethod) -> Result<Payment> {
        let payment = self
            .payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| Error::not_found("payment not found"))?;
        if !payment.can_retry() {
            return Ok(payment);
        }
        let key = payment.idempotency_key.clone();
        self.run_gateway(payment, payment_method, &key).await
    }

    async fn run_gateway(&self, payment: Payment, payment_method: &PaymentMethod, key: &str) -> Result<Payment> {
        match self
            .gateway
            .attempt(payment.amount, &payment.currency, &payment_method.gateway_token, key)
            .await
        {
            Ok(GatewayOutcome::Succeeded { txn_id }) => self.apply_success(payment, &txn_id).await,
            Ok(GatewayOutcome::Failed { reason }) => self.apply_failure(payment, &reason).await,
            Ok(GatewayOutcome::Pending { txn_id }) => {
                let mut pending = payment;
                pending.gateway_txn_id = Some(txn_id);
                self.payments.update(&pending).await
            }
            // Transient gateway errors resolve to "unknown outcome": the
            // payment stays pending and the scheduler or gateway callback
            // is the authority on the real result.
            Err(_) => Ok(payment),
        }
    }

    /// Out-of-band callback entry point for `payment_intent.succeeded`.
    /// Safe under duplicate delivery: a payment already resolved is
    /// returned unchanged.
    pub async fn mark_succeeded(&self, payment_id: Uuid, txn_id: &str) -> Result<Payment> {
        let payment = self
            .payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| Error::not_found("payment not found"))?;
        if payment.status != PaymentStatus::Pending {
            return Ok(payment);
        }
        self.apply_success(payment, txn_id).await
    }

    /// Out-of-band callback entry point for `payment_intent.failed`.
    pub async fn mark_failed(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        let payment = self
            .payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| Error::not_found("payment not found"))?;
        if payment.status != PaymentStatus::Pending {
            return Ok(payment);
        }
        self.apply_failure(payment, reason).await
    }

    async fn apply_success(&self, mut payment: Payment, txn_id: &str) -> Result<Payment> {
        payment.status = PaymentStatus::Succeeded;
        payment.gateway_txn_id = Some(txn_id.to_string());
        payment.next_retry_at = None;
        let payment = self.payments.update(&payment).await?;

        if let Some(mut invoice) = self.invoices.find_by_id(payment.invoice_id).await? {
            invoice.amount_paid += payment.amount;
            if invoice.amount_paid >= invoice.amount_due {
                invoice.status = InvoiceStatus::Paid;
                invoice.paid_at = Some(Utc::now());
            }
            let invoice = self.invoices.update(&invoice).await?;

            if invoice.status == InvoiceStatus::Paid {
                if let Some(subscription_id) = invoice.subscription_id {
                    if let Some(mut sub) = self.subscriptions.find_by_id(subscription_id).await? {
                        if sub.status == SubscriptionStatus::PastDue {
                            sub.status = SubscriptionStatus::Active;
                            let sub = self.subscriptions.update(&sub).await?;
                            enqueue_event(
                                &self.endpoints,
                                &self.events,
                                "subscription.updated",
                                serde_json::json!({"subscription_id": sub.id, "status": "active"}),
                            )
                            .await?;
                        }
                    }
                }
                dunning_controller::reverse_if_clear(&self.invoices, &self.accounts, invoice.account_id).await?;
                enqueue_event(
                    &self.endpoints,
                    &self.events,
                    "invoice.paid",
                    serde_json::json!({"invoice_id": invoice.id, "number": invoice.number}),
                )
                .await?;
            }
        }

        enqueue_event(
            &self.endpoints,
            &self.events,
            "payment.succeeded",
            serde_json::json!({"payment_id": payment.id, "invoice_id": payment.invoice_id}),
        )
        .await?;

        Ok(payment)
    }

    async fn apply_failure(&self, mut payment: Payment, reason: &str) -> Result<Payment> {
        let was_first_failure = payment.retry_count == 0;
        payment.status = PaymentStatus::Failed;
        payment.failure_message = Some(reason.to_string());
        payment.retry_count += 1;
        payment.next_retry_at = if (payment.retry_count as usize) <= RETRY_SCHEDULE_DAYS.len() {
            let idx = (payment.retry_count - 1) as usize;
            Some(payment.created_at + Duration::days(RETRY_SCHEDULE_DAYS[idx]))
        } else {
            None
        };
        let payment = self.payments.update(&payment).await?;

        if let Some(mut invoice) = self.invoices.find_by_id(payment.invoice_id).await? {
            if was_first_failure {
                if let Some(subscription_id) = invoice.subscription_id {
                    if let Some(mut sub) = self.subscriptions.find_by_id(subscription_id).await? {
                        if sub.status == SubscriptionStatus::Active {
                            sub.status = SubscriptionStatus::PastDue;
                            let sub = self.subscriptions.update(&sub).await?;
                            enqueue_event(
                                &self.endpoints,
                                &self.events,
                                "subscription.updated",
                                serde_json::json!({"subscription_id": sub.id, "status": "past_due"}),
                            )
                            .await?;
                        }
                    }
                }
            }
            if !payment.can_retry() && invoice.status == InvoiceStatus::Open {
                invoice.status = InvoiceStatus::PastDue;
                self.invoices.update(&invoice).await?;
            }
        }

        enqueue_event(
            &self.endpoints,
            &self.events,
            "payment.failed",
            serde_json::json!({"payment_id": payment.id, "invoice_id": payment.invoice_id, "reason": reason}),
        )
        .await?;

        Ok(payment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPaymentGateway;
    use crate::models::{Account, AccountStatus, CreateAccountRequest, Pagination, Subscription, SubscriptionHistory, WebhookEndpoint, WebhookEvent};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct FakePayments(Mutex<Vec<Payment>>);
    struct FakeInvoices(Mutex<Vec<Invoice>>);
    struct FakeAccounts(Mutex<Vec<Account>>);
    struct FakeSubscriptions(Mutex<Vec<Subscription>>);
    struct FakeEndpoints;
    struct FakeEvents(Mutex<Vec<WebhookEvent>>);

    #[async_trait]
    impl PaymentRepository for FakePayments {
        async fn create(&self, p: &Payment) -> Result<Payment> {
            let mut guard = self.0.lock().unwrap();
            if let Some(existing) = guard.iter().find(|x| x.idempotency_key == p.idempotency_key) {
                return Ok(existing.clone());
            }
            guard.push(p.clone());
            Ok(p.clone())
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
            Ok(self.0.lock().unwrap().iter().find(|p| p.id == id).cloned())
        }
        async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>> {
            Ok(self.0.lock().unwrap().iter().find(|p| p.idempotency_key == key).cloned())
        }
        async fn update(&self, p: &Payment) -> Result<Payment> {
            let mut guard = self.0.lock().unwrap();
            let slot = guard.iter_mut().find(|x| x.id == p.id).unwrap();
            *slot = p.clone();
            Ok(p.clone())
        }
        async fn due_for_retry(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Payment>> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl InvoiceRepository for FakeInvoices {
        async fn create(&self, i: &Invoice) -> Result<Invoice> {
            self.0.lock().unwrap().push(i.clone());
            Ok(i.clone())
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Invoice>> {
            Ok(self.0.lock().unwrap().iter().find(|i| i.id == id).cloned())
        }
        async fn find_for_period(&self, _s: Uuid, _p: DateTime<Utc>) -> Result<Option<Invoice>> {
            unimplemented!()
        }
        async fn update(&self, i: &Invoice) -> Result<Invoice> {
            let mut guard = self.0.lock().unwrap();
            let slot = guard.iter_mut().find(|x| x.id == i.id).unwrap();
            *slot = i.clone();
            Ok(i.clone())
        }
        async fn list_open_or_past_due(&self, account_id: Uuid) -> Result<Vec<Invoice>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|i| i.account_id == account_id && matches!(i.status, InvoiceStatus::Open | InvoiceStatus::PastDue))
                .cloned()
                .collect())
        }
        async fn overdue(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Invoice>> {
            unimplemented!()
        }
        async fn dunning_candidates(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Invoice>> {
            unimplemented!()
        }
        async fn recently_closed(&self, _since: DateTime<Utc>, _limit: i64) -> Result<Vec<Invoice>> {
            unimplemented!()
        }
        async fn next_invoice_number(&self) -> Result<i64> {
            unimplemented!()
        }
        async fn total_collected(&self) -> Result<i64> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl AccountRepository for FakeAccounts {
        async fn create(&self, _r: CreateAccountRequest) -> Result<Account> {
            unimplemented!()
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
            Ok(self.0.lock().unwrap().iter().find(|a| a.id == id).cloned())
        }
        async fn find_by_email(&self, _email: &str) -> Result<Option<Account>> {
            unimplemented!()
        }
        async fn update_status(&self, id: Uuid, status: AccountStatus) -> Result<Account> {
            let mut guard = self.0.lock().unwrap();
            let slot = guard.iter_mut().find(|a| a.id == id).unwrap();
            slot.status = status;
            Ok(slot.clone())
        }
        async fn list(&self, _p: &Pagination) -> Result<Vec<Account>> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl SubscriptionRepository for FakeSubscriptions {
        async fn create(&self, s: &Subscription) -> Result<Subscription> {
            self.0.lock().unwrap().push(s.clone());
            Ok(s.clone())
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>> {
            Ok(self.0.lock().unwrap().iter().find(|s| s.id == id).cloned())
        }
        async fn update(&self, s: &Subscription) -> Result<Subscription> {
            let mut guard = self.0.lock().unwrap();
            let slot = guard.iter_mut().find(|x| x.id == s.id).unwrap();
            *slot = s.clone();
            Ok(s.clone())
        }
        async fn list_by_account(&self, _a: Uuid) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn due_for_billing(&self, _b: DateTime<Utc>, _l: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn trialing_expired(&self, _b: DateTime<Utc>, _l: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn pending_plan_change_due(&self, _b: DateTime<Utc>, _l: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn paused_resumable(&self, _b: DateTime<Utc>, _l: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn paused_stale(&self, _b: DateTime<Utc>, _l: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn billable_count(&self) -> Result<Vec<(Uuid, i64)>> {
            unimplemented!()
        }
        async fn churned_since(&self, _since: DateTime<Utc>) -> Result<i64> {
            unimplemented!()
        }
        async fn active_account_count(&self) -> Result<i64> {
            unimplemented!()
        }
        async fn append_history(&self, _e: &SubscriptionHistory) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl WebhookEndpointRepository for FakeEndpoints {
        async fn create(&self, e: &WebhookEndpoint) -> Result<WebhookEndpoint> {
            Ok(e.clone())
        }
        async fn list_active(&self) -> Result<Vec<WebhookEndpoint>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl WebhookEventRepository for FakeEvents {
        async fn create(&self, e: &WebhookEvent) -> Result<WebhookEvent> {
            self.0.lock().unwrap().push(e.clone());
            Ok(e.clone())
        }
        async fn update(&self, e: &WebhookEvent) -> Result<WebhookEvent> {
            Ok(e.clone())
        }
        async fn pending_delivery(&self, _now: DateTime<Utc>, _limit: i64) -> Result<Vec<WebhookEvent>> {
            Ok(Vec::new())
        }
    }

    fn invoice(account_id: Uuid, amount_due: i64) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            account_id,
            subscription_id: None,
            number: "INV-000001".into(),
            status: InvoiceStatus::Open,
            amount_due,
            amount_paid: 0,
            tax: 0,
            currency: "USD".into(),
            due_date: now,
            paid_at: None,
            voided_at: None,
            line_items: serde_json::json!([]),
            period_start: None,
            period_end: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn payment_method(token: &str) -> PaymentMethod {
        PaymentMethod {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            gateway_token: token.into(),
            brand: None,
            last4: None,
            exp_month: None,
            exp_year: None,
            is_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn orchestrator() -> PaymentOrchestrator<FakePayments, FakeInvoices, FakeAccounts, FakeSubscriptions, FakeEndpoints, FakeEvents, MockPaymentGateway> {
        PaymentOrchestrator::new(
            FakePayments(Mutex::new(Vec::new())),
            FakeInvoices(Mutex::new(Vec::new())),
            FakeAccounts(Mutex::new(Vec::new())),
            FakeSubscriptions(Mutex::new(Vec::new())),
            FakeEndpoints,
            FakeEvents(Mutex::new(Vec::new())),
            MockPaymentGateway::default(),
        )
    }

    #[tokio::test]
    async fn repeated_idempotency_key_returns_same_payment() {
        let orch = orchestrator();
        let inv = invoice(Uuid::new_v4(), 1000);
        orch.invoices.create(&inv).await.unwrap();
        let method = payment_method("tok_good");

        let first = orch.attempt(&inv, &method, Some("key_1".into())).await.unwrap();
        let second = orch.attempt(&inv, &method, Some("key_1".into())).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(orch.payments.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn successful_attempt_marks_invoice_paid() {
        let orch = orchestrator();
        let inv = invoice(Uuid::new_v4(), 1000);
        orch.invoices.create(&inv).await.unwrap();
        let method = payment_method("tok_good");

        let payment = orch.attempt(&inv, &method, None).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);

        let updated = orch.invoices.find_by_id(inv.id).await.unwrap().unwrap();
        assert_eq!(updated.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn declined_attempt_schedules_first_retry_and_marks_subscription_past_due() {
        let orch = orchestrator();
        let account_id = Uuid::new_v4();
        orch.accounts.0.lock().unwrap().push(Account {
            id: account_id,
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
        });

        let sub_id = Uuid::new_v4();
        orch.subscriptions.0.lock().unwrap().push(Subscription {
            id: sub_id,
            account_id,
            plan_id: Uuid::new_v4(),
            pending_plan_id: None,
            status: SubscriptionStatus::Active,
            quantity: 1,
            current_period_start: Utc::now(),
            current_period_end: Utc::now(),
            cancel_at_period_end: false,
            cancelled_at: None,
            trial_end: None,
            pause_resumes_at: None,
            paused_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let mut inv = invoice(account_id, 1000);
        inv.subscription_id = Some(sub_id);
        orch.invoices.create(&inv).await.unwrap();
        let method = payment_method("tok_decline");

        let payment = orch.attempt(&inv, &method, None).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.retry_count, 1);
        assert!(payment.next_retry_at.is_some());

        let sub = orch.subscriptions.find_by_id(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn duplicate_callback_after_success_is_noop() {
        let orch = orchestrator();
        let inv = invoice(Uuid::new_v4(), 1000);
        orch.invoices.create(&inv).await.unwrap();
        let method = payment_method("tok_good");
        let payment = orch.attempt(&inv, &method, None).await.unwrap();

        let again = orch.mark_succeeded(payment.id, "txn_other").await.unwrap();
        assert_eq!(again.gateway_txn_id, payment.gateway_txn_id);
    }
}
