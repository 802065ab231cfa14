//! Usage Recorder and late-usage reconciliation (§4.7).

use chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

use crate::models::{RecordUsageRequest, SubscriptionStatus, UsageRecord};
use crate::repository::{SubscriptionRepository, UsageRecordRepository};
use crate::{Error, Result};

pub struct UsageRecorder<Usg, Sub> {
    usage: Usg,
    subscriptions: Sub,
}

impl<Usg, Sub> UsageRecorder<Usg, Sub>
where
    Usg: UsageRecordRepository,
    Sub: SubscriptionRepository,
{
    pub fn new(usage: Usg, subscriptions: Sub) -> Self {
        Self { usage, subscriptions }
    }

    /// Idempotent on `idempotency_key`. Rejects ingest for subscriptions
    /// that are paused or cancelled; trialing and past_due subscriptions
    /// still accept usage so nothing is lost while billing catches up.
    pub async fn record(&self, request: RecordUsageRequest) -> Result<UsageRecord> {
        request.validate().map_err(|e| Error::validation(e.to_string()))?;
        if let Some(existing) = self.usage.find_by_idempotency_key(&request.idempotency_key).await? {
            return Ok(existing);
        }

        let subscription = self
            .subscriptions
            .find_by_id(request.subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("subscription not found"))?;
        if matches!(
            subscription.status,
            SubscriptionStatus::Paused | SubscriptionStatus::Cancelled
        ) {
            return Err(Error::illegal_state("subscription is not accepting usage"));
        }

        let record = UsageRecord {
            id: Uuid::new_v4(),
            subscription_id: request.subscription_id,
            metric: request.metric,
            quantity: request.quantity,
            timestamp: request.timestamp,
            idempotency_key: request.idempotency_key,
            received_at: Utc::now(),
        };
        self.usage.create(&record).await
    }

    pub async fn aggregate(
        &self,
        subscription_id: Uuid,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        self.usage.aggregate(subscription_id, metric, from, to).await
    }

    /// Usage records for an already-closed period that arrived after the
    /// period closed. The Invoice Assembler turns these into supplemental
    /// invoices; this call only finds them.
    pub async fn late_usage(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        self.usage.late_for_period(subscription_id, period_start, period_end).await
    }
}
