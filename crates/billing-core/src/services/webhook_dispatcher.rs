//! Event Outbox / Webhook Dispatcher (§4.8).
//!
//! Two halves: [`enqueue_event`] is called by every other service, in the
//! same logical step as the state change it describes, to match active
//! endpoints against the new event and insert one `WebhookEvent` row per
//! match. [`WebhookDispatcher`] is the separate drain loop that actually
//! delivers those rows over HTTP with retry+backoff.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::{WebhookEvent, WebhookStatus};
use crate::repository::{WebhookEndpointRepository, WebhookEventRepository};
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex hmac>` of the serialized envelope, or `None` if no signing
/// secret is configured.
fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Envelope delivered to subscriber endpoints (§6).
#[derive(Debug, Serialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Writes one `WebhookEvent` row per active endpoint whose subscription
/// pattern matches `event_type`. Called transactionally alongside the
/// state change it reports by every other service in this crate.
pub async fn enqueue_event<EP, EV>(
    endpoints: &EP,
    events: &EV,
    event_type: &str,
    payload: serde_json::Value,
) -> Result<Vec<WebhookEvent>>
where
    EP: WebhookEndpointRepository,
    EV: WebhookEventRepository,
{
    let mut created = Vec::new();
    for endpoint in endpoints.list_active().await? {
        if !endpoint.active || !endpoint.matches(event_type) {
            continue;
        }
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            endpoint_url: endpoint.url.clone(),
            status: WebhookStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
            delivered_at: None,
        };
        created.push(events.create(&event).await?);
    }
    Ok(created)
}

/// Backoff schedule in minutes after the Nth failure, N starting at 1.
pub const BACKOFF_MINUTES: [i64; 5] = [3, 6, 12, 24, 48];

/// Delivers pending webhook rows over HTTP. At-least-once: consumers must
/// dedupe on `EventEnvelope::id`. Ordering across endpoints is not
/// guaranteed; ordering within one endpoint's same event type is
/// best-effort (insertion order of the draining query).
pub struct WebhookDispatcher<EV> {
    events: EV,
    http: reqwest::Client,
    max_retries: u32,
    backoff_minutes: Vec<i64>,
    signing_secret: Option<String>,
}

pub struct DeliveryReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed_terminal: usize,
}

impl<EV> WebhookDispatcher<EV>
where
    EV: WebhookEventRepository,
{
    pub fn new(
        events: EV,
        timeout_secs: u64,
        max_retries: u32,
        backoff_minutes: Vec<i64>,
        signing_secret: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client build");
        Self {
            events,
            http,
            max_retries,
            backoff_minutes,
            signing_secret,
        }
    }

    /// One drain pass: pulls pending-and-due rows (bounded by `limit`) and
    /// attempts delivery of each independently, so one slow/broken endpoint
    /// never blocks the others.
    pub async fn dispatch_once(&self, limit: i64) -> Result<DeliveryReport> {
        let now = Utc::now();
        let due = self.events.pending_delivery(now, limit).await?;
        let mut report = DeliveryReport {
            delivered: 0,
            retried: 0,
            failed_terminal: 0,
        };

        for mut event in due {
            let envelope = EventEnvelope {
                id: event.id,
                event_type: event.event_type.clone(),
                created: event.created_at,
                data: event.payload.clone(),
            };

            let mut request = self.http.post(&event.endpoint_url).json(&envelope);
            if let Some(secret) = &self.signing_secret {
                let body = serde_json::to_vec(&envelope)?;
                request = request.header("X-Billing-Signature", sign(&body, secret));
            }
            let outcome = request.send().await;

            match outcome {
                Ok(resp) if resp.status().is_success() => {
                    event.status = WebhookStatus::Delivered;
                    event.delivered_at = Some(Utc::now());
                    self.events.update(&event).await?;
                    report.delivered += 1;
                }
                Ok(resp) => {
                    self.record_failure(&mut event, format!("http {}", resp.status())).await?;
                    if event.status == WebhookStatus::Failed {
                        report.failed_terminal += 1;
                    } else {
                        report.retried += 1;
                    }
                }
                Err(err) => {
                    self.record_failure(&mut event, err.to_string()).await?;
                    if event.status == WebhookStatus::Failed {
                        report.failed_terminal += 1;
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn record_failure(&self, event: &mut WebhookEvent, error: String) -> Result<()> {
        event.retry_count += 1;
        event.last_error = Some(error);
        if event.retry_count as u32 >= self.max_retries {
            event.status = WebhookStatus::Failed;
            event.next_retry_at = None;
        } else {
            let idx = ((event.retry_count - 1).max(0) as usize).min(self.backoff_minutes.len() - 1);
            event.status = WebhookStatus::Pending;
            event.next_retry_at = Some(Utc::now() + Duration::minutes(self.backoff_minutes[idx]));
        }
        self.events.update(event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WebhookEndpoint;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeEndpoints(Vec<WebhookEndpoint>);
    struct FakeEvents(Mutex<Vec<WebhookEvent>>);

    #[async_trait]
    impl WebhookEndpointRepository for FakeEndpoints {
        async fn create(&self, e: &WebhookEndpoint) -> Result<WebhookEndpoint> {
            Ok(e.clone())
        }
        async fn list_active(&self) -> Result<Vec<WebhookEndpoint>> {
            Ok(self.0.clone())
        }
    }

    #[async_trait]
    impl WebhookEventRepository for FakeEvents {
        async fn create(&self, e: &WebhookEvent) -> Result<WebhookEvent> {
            self.0.lock().unwrap().push(e.clone());
            Ok(e.clone())
        }
        async fn update(&self, e: &WebhookEvent) -> Result<WebhookEvent> {
            let mut guard = self.0.lock().unwrap();
            let slot = guard.iter_mut().find(|x| x.id == e.id).unwrap();
            *slot = e.clone();
            Ok(e.clone())
        }
        async fn pending_delivery(&self, _now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookEvent>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.status == WebhookStatus::Pending)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    fn endpoint(patterns: &[&str]) -> WebhookEndpoint {
        WebhookEndpoint {
            id: Uuid::new_v4(),
            account_id: None,
            url: "https://example.com/hook".into(),
            events: serde_json::json!(patterns),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_matches_only_subscribed_endpoints() {
        let endpoints = FakeEndpoints(vec![endpoint(&["invoice.*"]), endpoint(&["payment.succeeded"])]);
        let events = FakeEvents(Mutex::new(Vec::new()));
        let created = enqueue_event(&endpoints, &events, "invoice.paid", serde_json::json!({})).await.unwrap();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn wildcard_endpoint_gets_every_event() {
        let endpoints = FakeEndpoints(vec![endpoint(&["*"])]);
        let events = FakeEvents(Mutex::new(Vec::new()));
        let a = enqueue_event(&endpoints, &events, "invoice.paid", serde_json::json!({})).await.unwrap();
        let b = enqueue_event(&endpoints, &events, "credit.created", serde_json::json!({})).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
