//! Invoice Assembler (§4.3).

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Account, Invoice, InvoiceStatus, LineItem, LineItemType, Plan, Subscription};
use crate::repository::{
    AccountRepository, CreditRepository, InvoiceRepository, PlanRepository, SubscriptionRepository,
    UsageRecordRepository, WebhookEndpointRepository, WebhookEventRepository,
};
use crate::services::credit_manager::CreditManager;
use crate::services::pricing_engine::{self, UsageAggregate};
use crate::services::webhook_dispatcher;
use crate::tax::{TaxExemptReason, TaxOracle, TaxResult};
use crate::{Error, Result};

/// Grace window a supplemental invoice's due date gets, same as proration.
const SUPPLEMENTAL_DUE_DAYS: i64 = 7;
const PRORATION_DUE_DAYS: i64 = 7;

enum InvoiceKind {
    Regular,
    Proration,
    Supplemental,
}

pub struct InvoiceAssembler<Inv, Sub, Pl, Acc, Usg, Crd, EP, EV, Tax> {
    invoices: Inv,
    subscriptions: Sub,
    plans: Pl,
    accounts: Acc,
    usage: Usg,
    credits: CreditManager<Crd, EP, EV>,
    endpoints: EP,
    events: EV,
    tax_oracle: Tax,
}

impl<Inv, Sub, Pl, Acc, Usg, Crd, EP, EV, Tax> InvoiceAssembler<Inv, Sub, Pl, Acc, Usg, Crd, EP, EV, Tax>
where
    Inv: InvoiceRepository,
    Sub: SubscriptionRepository,
    Pl: PlanRepository,
    Acc: AccountRepository,
    Usg: UsageRecordRepository,
    Crd: CreditRepository,
    EP: WebhookEndpointRepository + Clone,
    EV: WebhookEventRepository + Clone,
    Tax: TaxOracle,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoices: Inv,
        subscriptions: Sub,
        plans: Pl,
        accounts: Acc,
        usage: Usg,
        credits: Crd,
        endpoints: EP,
        events: EV,
        tax_oracle: Tax,
    ) -> Self {
        Self {
            invoices,
            subscriptions,
            plans,
            accounts,
            usage,
            credits: CreditManager::new(credits, endpoints.clone(), events.clone()),
            endpoints,
            events,
            tax_oracle,
        }
    }

    /// Regular billing-cycle invoice for the subscription's current period.
    /// Rejects if a non-void invoice already exists for this period —
    /// the scheduler must only ever call this once per (subscription,
    /// period_start).
    pub async fn generate(&self, subscription_id: Uuid) -> Result<Invoice> {
        let subscription = self
            .subscriptions
            .find_by_id(subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("subscription not found"))?;

        if self
            .invoices
            .find_for_period(subscription_id, subscription.current_period_start)
            .await?
            .is_some()
        {
            return Err(Error::conflict("invoice already exists for this period"));
        }

        let plan = self
            .plans
            .find_by_id(subscription.plan_id)
            .await?
            .ok_or_else(|| Error::not_found("plan not found"))?;
        let account = self
            .accounts
            .find_by_id(subscription.account_id)
            .await?
            .ok_or_else(|| Error::not_found("account not found"))?;

        let mut usage_aggregates = Vec::new();
        if plan.usage_type.is_some() {
            let metrics = self
                .usage
                .distinct_metrics(
                    subscription_id,
                    subscription.current_period_start,
                    subscription.current_period_end,
                )
                .await?;
            for metric in metrics {
                let total = self
                    .usage
                    .aggregate(
                        subscription_id,
                        &metric,
                        subscription.current_period_start,
                        subscription.current_period_end,
                    )
                    .await?;
                usage_aggregates.push(UsageAggregate { metric, total });
            }
        }

        let line_items = pricing_engine::billing_cycle_line_items(
            &subscription,
            &plan,
            subscription.current_period_start,
            subscription.current_period_end,
            &usage_aggregates,
        )?;

        self.assemble(
            &account,
            Some(&subscription),
            line_items,
            Utc::now() + Duration::days(PRORATION_DUE_DAYS),
            Some(subscription.current_period_start),
            Some(subscription.current_period_end),
            InvoiceKind::Regular,
        )
        .await
    }

    /// Mid-cycle plan change: one proration-credit line for unused time on
    /// the old plan, one proration-charge line for the new plan's remaining
    /// time. The usual "already exists for this period" guard is skipped —
    /// a subscription may be prorated more than once per period.
    pub async fn create_proration_invoice(
        &self,
        subscription_id: Uuid,
        old_plan: &Plan,
        new_plan: &Plan,
        change_date: DateTime<Utc>,
    ) -> Result<Invoice> {
        let subscription = self
            .subscriptions
            .find_by_id(subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("subscription not found"))?;
        let account = self
            .accounts
            .find_by_id(subscription.account_id)
            .await?
            .ok_or_else(|| Error::not_found("account not found"))?;

        let line_items = pricing_engine::proration_line_items(
            old_plan.amount * subscription.quantity as i64,
            new_plan.amount * subscription.quantity as i64,
            subscription.current_period_start,
            subscription.current_period_end,
            change_date,
        );

        self.assemble(
            &account,
            Some(&subscription),
            line_items,
            Utc::now() + Duration::days(PRORATION_DUE_DAYS),
            Some(subscription.current_period_start),
            Some(subscription.current_period_end),
            InvoiceKind::Proration,
        )
        .await
    }

    /// Late-usage reconciliation (§4.7): one line per late usage record,
    /// priced individually at the plan's unit rate. Always issues a fresh
    /// supplemental invoice rather than attempting to reopen the original
    /// one — see the open question recorded in DESIGN.md.
    pub async fn create_supplemental_invoice(
        &self,
        subscription_id: Uuid,
        metric: &str,
        late_quantity: i64,
    ) -> Result<Invoice> {
        let subscription = self
            .subscriptions
            .find_by_id(subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("subscription not found"))?;
        let plan = self
            .plans
            .find_by_id(subscription.plan_id)
            .await?
            .ok_or_else(|| Error::not_found("plan not found"))?;
        let account = self
            .accounts
            .find_by_id(subscription.account_id)
            .await?
            .ok_or_else(|| Error::not_found("account not found"))?;

        let usage_type = plan
            .usage_type
            .ok_or_else(|| Error::validation("plan has no usage pricing to reconcile"))?;
        let tiers = plan.tiers()?;
        let amount = pricing_engine::usage_charge(usage_type, late_quantity, &tiers);

        let line_items = vec![LineItem {
            description: format!("late usage: {metric}"),
            amount,
            quantity: late_quantity,
            kind: LineItemType::LateUsage,
        }];

        self.assemble(
            &account,
            Some(&subscription),
            line_items,
            Utc::now() + Duration::days(SUPPLEMENTAL_DUE_DAYS),
            Some(subscription.current_period_start),
            Some(subscription.current_period_end),
            InvoiceKind::Supplemental,
        )
        .await
    }

    /// Shared tail of every invoice-producing entry point: tax, numbering,
    /// persistence, credit application, possible immediate settlement,
    /// webhook emission.
    #[allow(clippy::too_many_arguments)]
    async fn assemble(
        &self,
        account: &Account,
        subscription: Option<&Subscription>,
        line_items: Vec<LineItem>,
        due_date: DateTime<Utc>,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
        kind: InvoiceKind,
    ) -> Result<Invoice> {
        let subtotal: i64 = line_items.iter().map(|i| i.amount).sum();

        let tax = self.resolve_tax(account, subtotal).await?;

        let number = format!("INV-{:06}", self.invoices.next_invoice_number().await?);
        let now = Utc::now();
        let mut metadata = serde_json::json!({});
        match kind {
            InvoiceKind::Regular => {}
            InvoiceKind::Proration => metadata["proration"] = serde_json::json!(true),
            InvoiceKind::Supplemental => metadata["supplemental"] = serde_json::json!(true),
        }

        let invoice = Invoice {
            id: Uuid::new_v4(),
            account_id: account.id,
            subscription_id: subscription.map(|s| s.id),
            number,
            status: InvoiceStatus::Open,
            amount_due: subtotal + tax.amount,
            amount_paid: 0,
            tax: tax.amount,
            currency: account.currency.clone(),
            due_date,
            paid_at: None,
            voided_at: None,
            line_items: serde_json::to_value(&line_items)?,
            period_start,
            period_end,
            metadata,
            created_at: now,
            updated_at: now,
        };
        let mut invoice = self.invoices.create(&invoice).await?;

        self.credits.apply_to_invoice(&mut invoice).await?;
        if invoice.amount_due <= invoice.amount_paid {
            invoice.status = InvoiceStatus::Paid;
            invoice.paid_at = Some(now);
        }
        let invoice = self.invoices.update(&invoice).await?;

        webhook_dispatcher::enqueue_event(
            &self.endpoints,
            &self.events,
            "invoice.created",
            serde_json::json!({ "invoice_id": invoice.id, "account_id": invoice.account_id }),
        )
        .await?;

        Ok(invoice)
    }

    async fn resolve_tax(&self, account: &Account, subtotal: i64) -> Result<TaxResult> {
        if account.tax_exempt {
            return Ok(TaxResult::exempt(TaxExemptReason::TaxExempt));
        }
        if account.has_reverse_charge_vat() {
            return Ok(TaxResult::exempt(TaxExemptReason::ReverseCharge));
        }
        match self.tax_oracle.calculate(&account.timezone, subtotal, &account.currency).await {
            Ok(result) => Ok(result),
            Err(_) => {
                let fallback = (subtotal as f64 * crate::tax::FALLBACK_RATE).floor() as i64;
                Ok(TaxResult {
                    amount: fallback,
                    rate: crate::tax::FALLBACK_RATE,
                    breakdown: vec![("fallback".to_string(), fallback)],
                    reason: None,
                })
            }
        }
    }

    /// Allowed only from {draft, open, past_due}. Paid invoices cannot be
    /// voided through this entry point — reversing a paid invoice is a
    /// credit (§4.5), issued by the caller via `CreditManager::refund_from_void`.
    pub async fn void(&self, invoice_id: Uuid, _reason: &str) -> Result<Invoice> {
        let mut invoice = self
            .invoices
            .find_by_id(invoice_id)
            .await?
            .ok_or_else(|| Error::not_found("invoice not found"))?;

        if !matches!(
            invoice.status,
            InvoiceStatus::Draft | InvoiceStatus::Open | InvoiceStatus::PastDue
        ) {
            return Err(Error::illegal_state("invoice cannot be voided from its current status"));
        }

        invoice.status = InvoiceStatus::Void;
        invoice.voided_at = Some(Utc::now());
        let invoice = self.invoices.update(&invoice).await?;

        webhook_dispatcher::enqueue_event(
            &self.endpoints,
            &self.events,
            "invoice.voided",
            serde_json::json!({ "invoice_id": invoice.id, "account_id": invoice.account_id }),
        )
        .await?;

        Ok(invoice)
    }
}
