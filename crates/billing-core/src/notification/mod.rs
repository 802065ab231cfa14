//! Notification Sink external interface. Delivery is out of scope; this
//! module specifies the best-effort contract the Dunning Controller
//! depends on.

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Reminder,
    Warning,
    ServiceBlocked,
}

#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, account_id: Uuid, kind: NotificationKind, invoice_id: Uuid);
}

/// Logs notifications instead of delivering them. Real email/SMS/push
/// delivery is explicitly out of scope (§1).
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(&self, account_id: Uuid, kind: NotificationKind, invoice_id: Uuid) {
        tracing::info!(
            ?account_id,
            ?kind,
            ?invoice_id,
            "dunning notification (delivery out of scope)"
        );
    }
}
