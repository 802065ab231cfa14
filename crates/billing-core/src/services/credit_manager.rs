//! Credit Manager (§4.5).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Credit, Invoice};
use crate::repository::{CreditRepository, WebhookEndpointRepository, WebhookEventRepository};
use crate::services::webhook_dispatcher::enqueue_event;
use crate::Result;

pub struct CreditManager<C, EP, EV> {
    credits: C,
    endpoints: EP,
    events: EV,
}

impl<C, EP, EV> CreditManager<C, EP, EV>
where
    C: CreditRepository,
    EP: WebhookEndpointRepository,
    EV: WebhookEventRepository,
{
    pub fn new(credits: C, endpoints: EP, events: EV) -> Self {
        Self { credits, endpoints, events }
    }

    pub async fn create(
        &self,
        account_id: Uuid,
        amount: i64,
        currency: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Credit> {
        let credit = Credit {
            id: Uuid::new_v4(),
            account_id,
            amount,
            currency: currency.to_string(),
            reason: reason.to_string(),
            expires_at,
            applied_to_invoice_id: None,
            applied_at: None,
            created_at: Utc::now(),
        };
        let created = self.credits.create(&credit).await?;
        enqueue_event(
            &self.endpoints,
            &self.events,
            "credit.created",
            serde_json::json!({ "credit_id": created.id, "account_id": created.account_id, "amount": created.amount }),
        )
        .await?;
        Ok(created)
    }

    /// Applies available credits FIFO (oldest first) to `invoice.amount_due`
    /// until either the invoice is covered or credits run out. Mutates
    /// `invoice.amount_due` in place; the caller is responsible for
    /// persisting the invoice itself. Returns the total amount applied.
    pub async fn apply_to_invoice(&self, invoice: &mut Invoice) -> Result<i64> {
        if invoice.amount_due <= 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let available = self
            .credits
            .available(invoice.account_id, &invoice.currency, now)
            .await?;

        let mut total_applied = 0i64;
        for credit in available {
            if invoice.amount_due <= 0 {
                break;
            }
            let applicable = credit.amount.min(invoice.amount_due);
            if applicable <= 0 {
                continue;
            }

            if applicable == credit.amount {
                let mut applied = credit.clone();
                applied.applied_to_invoice_id = Some(invoice.id);
                applied.applied_at = Some(now);
                self.credits.update(&applied).await?;
            } else {
                // Split: reduce the original to the applied amount and
                // mark it applied, then re-issue the remainder as a fresh
                // unapplied credit with the same expiry.
                let mut applied = credit.clone();
                applied.amount = applicable;
                applied.applied_to_invoice_id = Some(invoice.id);
                applied.applied_at = Some(now);
                self.credits.update(&applied).await?;

                let remainder = Credit {
                    id: Uuid::new_v4(),
                    account_id: credit.account_id,
                    amount: credit.amount - applicable,
                    currency: credit.currency.clone(),
                    reason: credit.reason.clone(),
                    expires_at: credit.expires_at,
                    applied_to_invoice_id: None,
                    applied_at: None,
                    created_at: credit.created_at,
                };
                self.credits.create(&remainder).await?;
            }

            invoice.amount_due -= applicable;
            total_applied += applicable;
        }

        if total_applied > 0 {
            enqueue_event(
                &self.endpoints,
                &self.events,
                "credit.applied",
                serde_json::json!({ "invoice_id": invoice.id, "account_id": invoice.account_id, "amount": total_applied }),
            )
            .await?;
        }

        Ok(total_applied)
    }

    /// Issues a credit equal to `amount` when a paid invoice is reversed
    /// through the void path (§4.3).
    pub async fn refund_from_void(&self, invoice: &Invoice, amount: i64, reason: &str) -> Result<Credit> {
        self.create(invoice.account_id, amount, &invoice.currency, reason, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceStatus, WebhookEndpoint, WebhookEvent};
    use crate::repository::{WebhookEndpointRepository, WebhookEventRepository};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeCredits(Mutex<Vec<Credit>>);
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
    impl CreditRepository for FakeCredits {
        async fn create(&self, c: &Credit) -> Result<Credit> {
            self.0.lock().unwrap().push(c.clone());
            Ok(c.clone())
        }
        async fn update(&self, c: &Credit) -> Result<Credit> {
            let mut guard = self.0.lock().unwrap();
            let slot = guard.iter_mut().find(|x| x.id == c.id).unwrap();
            *slot = c.clone();
            Ok(c.clone())
        }
        async fn available(&self, account_id: Uuid, currency: &str, now: DateTime<Utc>) -> Result<Vec<Credit>> {
            let mut list: Vec<Credit> = self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|c| {
                    c.account_id == account_id
                        && c.currency == currency
                        && c.is_available(now)
                })
                .cloned()
                .collect();
            list.sort_by_key(|c| c.created_at);
            Ok(list)
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

    #[tokio::test]
    async fn fifo_application_with_split_matches_scenario_d() {
        let account_id = Uuid::new_v4();
        let manager = CreditManager::new(FakeCredits(Mutex::new(Vec::new())), FakeEndpoints, FakeEvents(Mutex::new(Vec::new())));

        let older = manager.create(account_id, 1500, "USD", "older", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        manager.create(account_id, 1000, "USD", "newer", None).await.unwrap();

        let mut inv = invoice(account_id, 2000);
        let applied = manager.apply_to_invoice(&mut inv).await.unwrap();

        assert_eq!(applied, 2000);
        assert_eq!(inv.amount_due, 0);

        let remaining = manager.credits.available(account_id, "USD", Utc::now()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].amount, 500);
        assert_ne!(remaining[0].id, older.id);
    }

    #[tokio::test]
    async fn no_available_credits_applies_nothing() {
        let account_id = Uuid::new_v4();
        let manager = CreditManager::new(FakeCredits(Mutex::new(Vec::new())), FakeEndpoints, FakeEvents(Mutex::new(Vec::new())));
        let mut inv = invoice(account_id, 500);
        let applied = manager.apply_to_invoice(&mut inv).await.unwrap();
        assert_eq!(applied, 0);
        assert_eq!(inv.amount_due, 500);
    }
}
