//! Subscription Engine (§4.1): the subscription lifecycle state machine.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{
    Account, Plan, PlanInterval, Subscription, SubscriptionHistory, SubscriptionStatus,
};
use crate::repository::{
    AccountRepository, PlanRepository, SubscriptionRepository, WebhookEndpointRepository,
    WebhookEventRepository,
};
use crate::services::webhook_dispatcher::enqueue_event;
use crate::{Error, Result};
use tracing::debug;

pub struct SubscriptionEngine<S, P, A, EP, EV> {
    subscriptions: S,
    plans: P,
    accounts: A,
    endpoints: EP,
    events: EV,
}

impl<S, P, A, EP, EV> SubscriptionEngine<S, P, A, EP, EV>
where
    S: SubscriptionRepository,
    P: PlanRepository,
    A: AccountRepository,
    EP: WebhookEndpointRepository,
    EV: WebhookEventRepository,
{
    pub fn new(subscriptions: S, plans: P, accounts: A, endpoints: EP, events: EV) -> Self {
        Self { subscriptions, plans, accounts, endpoints, events }
    }

    async fn emit(&self, event_type: &str, subscription: &Subscription) -> Result<()> {
        enqueue_event(
            &self.endpoints,
            &self.events,
            event_type,
            serde_json::json!({
                "subscription_id": subscription.id,
                "account_id": subscription.account_id,
                "status": format!("{:?}", subscription.status),
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn create(
        &self,
        account_id: Uuid,
        plan_id: Uuid,
        quantity: i32,
        explicit_trial_end: Option<DateTime<Utc>>,
    ) -> Result<Subscription> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| Error::not_found("account not found"))?;
        if account.is_blocked() {
            return Err(Error::account_blocked("account is blocked"));
        }

        let plan = self
            .plans
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| Error::validation("plan not found"))?;
        if !plan.active {
            return Err(Error::validation("plan is not active"));
        }
        self.check_currency_match(&account, &plan)?;

        let now = Utc::now();
        let trial_end = if plan.trial_days > 0 || explicit_trial_end.is_some() {
            let from_days = now + Duration::days(plan.trial_days as i64);
            Some(explicit_trial_end.unwrap_or(from_days).max(from_days))
        } else {
            None
        };
        let status = if trial_end.is_some() {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            account_id,
            plan_id,
            pending_plan_id: None,
            status,
            quantity: quantity.max(1),
            current_period_start: now,
            current_period_end: now + Duration::days(plan.interval.approximate_days()),
            cancel_at_period_end: false,
            cancelled_at: None,
            trial_end,
            pause_resumes_at: None,
            paused_at: None,
            created_at: now,
            updated_at: now,
        };

        let created = self.subscriptions.create(&subscription).await?;
        self.record_history(created.id, "subscription_created", None, &format!("{:?}", created.status), None)
            .await?;
        self.emit("subscription.created", &created).await?;
        debug!(subscription_id = %created.id, "subscription created");
        Ok(created)
    }

    pub async fn update(
        &self,
        id: Uuid,
        quantity: Option<i32>,
        cancel_at_period_end: Option<bool>,
    ) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Err(Error::illegal_state("subscription is cancelled"));
        }

        if let Some(quantity) = quantity {
            subscription.quantity = quantity.max(1);
        }
        if let Some(cancel_at_period_end) = cancel_at_period_end {
            subscription.cancel_at_period_end = cancel_at_period_end;
            subscription.cancelled_at = if cancel_at_period_end {
                Some(Utc::now())
            } else {
                None
            };
        }
        let updated = self.subscriptions.update(&subscription).await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    pub async fn cancel(&self, id: Uuid, immediate: bool) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Err(Error::illegal_state("subscription already cancelled"));
        }

        if immediate {
            subscription.status = SubscriptionStatus::Cancelled;
            subscription.cancelled_at = Some(Utc::now());
        } else {
            subscription.cancel_at_period_end = true;
            subscription.cancelled_at = Some(Utc::now());
        }
        let updated = self.subscriptions.update(&subscription).await?;
        self.record_history(id, "subscription_cancelled", None, &immediate.to_string(), None)
            .await?;
        if immediate {
            self.emit("subscription.cancelled", &updated).await?;
        } else {
            self.emit("subscription.updated", &updated).await?;
        }
        Ok(updated)
    }

    pub async fn pause(&self, id: Uuid, resumes_at: Option<DateTime<Utc>>) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        if !matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        ) {
            return Err(Error::illegal_state("subscription cannot be paused from its current status"));
        }
        let old = format!("{:?}", subscription.status);
        subscription.status = SubscriptionStatus::Paused;
        subscription.pause_resumes_at = resumes_at;
        subscription.paused_at = Some(Utc::now());
        let updated = self.subscriptions.update(&subscription).await?;
        self.record_history(id, "subscription_paused", Some(&old), "Paused", None)
            .await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    pub async fn resume(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        if subscription.status != SubscriptionStatus::Paused {
            return Err(Error::illegal_state("subscription is not paused"));
        }
        let pause_duration = subscription
            .paused_at
            .map(|paused_at| Utc::now() - paused_at)
            .unwrap_or_default();
        subscription.status = SubscriptionStatus::Active;
        subscription.current_period_end += pause_duration;
        subscription.pause_resumes_at = None;
        subscription.paused_at = None;
        let updated = self.subscriptions.update(&subscription).await?;
        self.record_history(id, "subscription_resumed", Some("Paused"), "Active", None)
            .await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    /// Returns the proration inputs the Invoice Assembler needs when the
    /// change is immediate; `None` when the change was deferred.
    pub async fn change_plan(
        &self,
        id: Uuid,
        new_plan_id: Uuid,
        immediate: bool,
        new_quantity: Option<i32>,
    ) -> Result<(Subscription, Option<(Plan, Plan, DateTime<Utc>)>)> {
        let mut subscription = self.get(id).await?;
        let account = self
            .accounts
            .find_by_id(subscription.account_id)
            .await?
            .ok_or_else(|| Error::not_found("account not found"))?;
        if account.is_blocked() {
            return Err(Error::account_blocked("account is blocked"));
        }

        let old_plan = self
            .plans
            .find_by_id(subscription.plan_id)
            .await?
            .ok_or_else(|| Error::internal("current plan missing"))?;
        let new_plan = self
            .plans
            .find_by_id(new_plan_id)
            .await?
            .ok_or_else(|| Error::validation("new plan not found"))?;
        self.check_currency_match(&account, &new_plan)?;

        if let Some(quantity) = new_quantity {
            subscription.quantity = quantity.max(1);
        }

        if immediate {
            subscription.plan_id = new_plan_id;
            subscription.pending_plan_id = None;
            let updated = self.subscriptions.update(&subscription).await?;
            let now = Utc::now();
            self.record_history(id, "plan_changed", Some(&old_plan.id.to_string()), &new_plan.id.to_string(), None)
                .await?;
            self.emit("subscription.updated", &updated).await?;
            Ok((updated, Some((old_plan, new_plan, now))))
        } else {
            subscription.pending_plan_id = Some(new_plan_id);
            let updated = self.subscriptions.update(&subscription).await?;
            self.emit("subscription.updated", &updated).await?;
            Ok((updated, None))
        }
    }

    /// Applies a deferred plan change once the current period has closed.
    pub async fn apply_pending_plan_change(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        let Some(pending) = subscription.pending_plan_id else {
            return Err(Error::illegal_state("no pending plan change"));
        };
        subscription.plan_id = pending;
        subscription.pending_plan_id = None;
        let updated = self.subscriptions.update(&subscription).await?;
        self.record_history(id, "plan_change_applied", None, &pending.to_string(), None)
            .await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    pub async fn activate_from_trial(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        if subscription.status != SubscriptionStatus::Trialing {
            return Err(Error::illegal_state("subscription is not trialing"));
        }
        subscription.status = SubscriptionStatus::Active;
        let updated = self.subscriptions.update(&subscription).await?;
        self.record_history(id, "trial_ended", Some("Trialing"), "Active", None)
            .await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    pub async fn mark_past_due(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        subscription.status = SubscriptionStatus::PastDue;
        let updated = self.subscriptions.update(&subscription).await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    pub async fn mark_active(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        subscription.status = SubscriptionStatus::Active;
        let updated = self.subscriptions.update(&subscription).await?;
        self.emit("subscription.updated", &updated).await?;
        Ok(updated)
    }

    /// Advances the billing window after a cycle closes.
    pub async fn advance_period(&self, id: Uuid, interval: PlanInterval) -> Result<Subscription> {
        let mut subscription = self.get(id).await?;
        subscription.current_period_start = subscription.current_period_end;
        subscription.current_period_end =
            subscription.current_period_start + Duration::days(interval.approximate_days());
        self.subscriptions.update(&subscription).await
    }

    async fn get(&self, id: Uuid) -> Result<Subscription> {
        self.subscriptions
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("subscription not found"))
    }

    fn check_currency_match(&self, account: &Account, plan: &Plan) -> Result<()> {
        if account.currency != plan.currency {
            return Err(Error::validation("currency mismatch between account and plan"));
        }
        Ok(())
    }

    async fn record_history(
        &self,
        subscription_id: Uuid,
        event_type: &str,
        old_value: Option<&str>,
        new_value: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        self.subscriptions
            .append_history(&SubscriptionHistory {
                id: Uuid::new_v4(),
                subscription_id,
                event_type: event_type.to_string(),
                old_value: old_value.map(str::to_string),
                new_value: new_value.to_string(),
                reason: reason.map(str::to_string),
                at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, CreateAccountRequest, Pagination, UsageType, WebhookEndpoint, WebhookEvent};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeAccounts(Mutex<Vec<Account>>);
    struct FakePlans(Mutex<Vec<Plan>>);
    struct FakeSubscriptions(Mutex<Vec<Subscription>>, Mutex<Vec<SubscriptionHistory>>);
    struct FakeEndpoints;
    struct FakeEvents(Mutex<Vec<WebhookEvent>>);

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
        async fn update_status(&self, _id: Uuid, _status: AccountStatus) -> Result<Account> {
            unimplemented!()
        }
        async fn list(&self, _p: &Pagination) -> Result<Vec<Account>> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl PlanRepository for FakePlans {
        async fn create(&self, _plan: &Plan) -> Result<Plan> {
            unimplemented!()
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>> {
            Ok(self.0.lock().unwrap().iter().find(|p| p.id == id).cloned())
        }
        async fn list_active(&self) -> Result<Vec<Plan>> {
            unimplemented!()
        }
        async fn deactivate(&self, _id: Uuid) -> Result<()> {
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
        async fn list_by_account(&self, _account_id: Uuid) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn due_for_billing(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn trialing_expired(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn pending_plan_change_due(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn paused_resumable(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Subscription>> {
            unimplemented!()
        }
        async fn paused_stale(&self, _before: DateTime<Utc>, _limit: i64) -> Result<Vec<Subscription>> {
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
        async fn append_history(&self, entry: &SubscriptionHistory) -> Result<()> {
            self.1.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn account(currency: &str) -> Account {
        let now = Utc::now();
        Account {
            id: Uuid::new_v4(),
            email: "a@example.com".into(),
            name: "Acme".into(),
            currency: currency.into(),
            timezone: "UTC".into(),
            tax_exempt: false,
            tax_id: None,
            vat_id: None,
            status: AccountStatus::Active,
            deleted_at: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn plan(currency: &str, trial_days: i32) -> Plan {
        let now = Utc::now();
        Plan {
            id: Uuid::new_v4(),
            name: "Pro".into(),
            interval: PlanInterval::Month,
            amount: 2000,
            currency: currency.into(),
            trial_days,
            usage_type: None::<UsageType>,
            tiers: None,
            active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn engine(
        account: Account,
        plan: Plan,
    ) -> SubscriptionEngine<FakeSubscriptions, FakePlans, FakeAccounts, FakeEndpoints, FakeEvents> {
        SubscriptionEngine::new(
            FakeSubscriptions(Mutex::new(Vec::new()), Mutex::new(Vec::new())),
            FakePlans(Mutex::new(vec![plan])),
            FakeAccounts(Mutex::new(vec![account])),
            FakeEndpoints,
            FakeEvents(Mutex::new(Vec::new())),
        )
    }

    #[tokio::test]
    async fn create_rejects_currency_mismatch() {
        let account = account("USD");
        let plan = plan("EUR", 0);
        let engine = engine(account.clone(), plan.clone());
        let err = engine.create(account.id, plan.id, 1, None).await.unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn create_without_trial_is_active_immediately() {
        let account = account("USD");
        let plan = plan("USD", 0);
        let engine = engine(account.clone(), plan.clone());
        let sub = engine.create(account.id, plan.id, 1, None).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn create_with_trial_days_is_trialing() {
        let account = account("USD");
        let plan = plan("USD", 14);
        let engine = engine(account.clone(), plan.clone());
        let sub = engine.create(account.id, plan.id, 1, None).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert!(sub.trial_end.is_some());
    }

    #[tokio::test]
    async fn pause_then_resume_extends_period_end() {
        let account = account("USD");
        let plan = plan("USD", 0);
        let engine = engine(account.clone(), plan.clone());
        let sub = engine.create(account.id, plan.id, 1, None).await.unwrap();
        let original_end = sub.current_period_end;

        let paused = engine.pause(sub.id, None).await.unwrap();
        assert_eq!(paused.status, SubscriptionStatus::Paused);

        let resumed = engine.resume(sub.id).await.unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);
        assert!(resumed.current_period_end >= original_end);
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let account = account("USD");
        let plan = plan("USD", 0);
        let engine = engine(account.clone(), plan.clone());
        let sub = engine.create(account.id, plan.id, 1, None).await.unwrap();
        engine.cancel(sub.id, true).await.unwrap();
        let err = engine.cancel(sub.id, true).await.unwrap_err();
        assert_eq!(err.category(), "illegal_state_transition");
    }

    #[tokio::test]
    async fn blocked_account_cannot_create_subscription() {
        let mut account = account("USD");
        account.status = AccountStatus::Blocked;
        let plan = plan("USD", 0);
        let engine = engine(account.clone(), plan.clone());
        let err = engine.create(account.id, plan.id, 1, None).await.unwrap_err();
        assert_eq!(err.category(), "account_blocked");
    }
}
