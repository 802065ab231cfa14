//! Dunning Controller (§4.6).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{AccountStatus, Invoice, NotificationKind};
use crate::notification::NotificationSink;
use crate::repository::{AccountRepository, InvoiceRepository};
use crate::Result;

const REMINDER_FROM_DAYS: i64 = 3;
const WARNING_FROM_DAYS: i64 = 7;
const BLOCKED_FROM_DAYS: i64 = 14;

pub struct DunningController<I, A, N> {
    invoices: I,
    accounts: A,
    notifications: N,
}

impl<I, A, N> DunningController<I, A, N>
where
    I: InvoiceRepository,
    A: AccountRepository,
    N: NotificationSink,
{
    pub fn new(invoices: I, accounts: A, notifications: N) -> Self {
        Self { invoices, accounts, notifications }
    }

    /// One sweep pass: escalates every overdue invoice by how many days
    /// past due it is. Each bracket's notification fires at most once per
    /// invoice, tracked via a metadata flag (§4.6).
    pub async fn sweep(&self, now: DateTime<Utc>, limit: i64) -> Result<usize> {
        let candidates = self.invoices.dunning_candidates(now, limit).await?;
        let count = candidates.len();
        for invoice in candidates {
            self.escalate(invoice, now).await?;
        }
        Ok(count)
    }

    async fn escalate(&self, mut invoice: Invoice, now: DateTime<Utc>) -> Result<()> {
        let days_overdue = (now - invoice.due_date).num_days();

        if days_overdue >= BLOCKED_FROM_DAYS {
            if !flag_set(&invoice, "dunning_blocked_sent") {
                self.notifications
                    .notify(invoice.account_id, NotificationKind::ServiceBlocked, invoice.id)
                    .await;
                set_flag(&mut invoice, "dunning_blocked_sent");
                self.invoices.update(&invoice).await?;
            }
            self.accounts.update_status(invoice.account_id, AccountStatus::Blocked).await?;
        } else if days_overdue >= WARNING_FROM_DAYS {
            if !flag_set(&invoice, "dunning_warning_sent") {
                self.notifications
                    .notify(invoice.account_id, NotificationKind::Warning, invoice.id)
                    .await;
                set_flag(&mut invoice, "dunning_warning_sent");
                self.invoices.update(&invoice).await?;
            }
            if let Some(account) = self.accounts.find_by_id(invoice.account_id).await? {
                if account.status == AccountStatus::Active {
                    self.accounts.update_status(invoice.account_id, AccountStatus::Warning).await?;
                }
            }
        } else if days_overdue >= REMINDER_FROM_DAYS && !flag_set(&invoice, "dunning_reminder_sent") {
            self.notifications
                .notify(invoice.account_id, NotificationKind::Reminder, invoice.id)
                .await;
            set_flag(&mut invoice, "dunning_reminder_sent");
            self.invoices.update(&invoice).await?;
        }

        Ok(())
    }
}

fn flag_set(invoice: &Invoice, key: &str) -> bool {
    invoice
        .metadata
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn set_flag(invoice: &mut Invoice, key: &str) {
    invoice.metadata[key] = serde_json::json!(true);
}

/// Reverse path: once an account has no remaining open/past-due invoices,
/// it returns to active regardless of how it got escalated. Called by the
/// Payment Orchestrator right after an invoice settles.
pub async fn reverse_if_clear<I, A>(invoices: &I, accounts: &A, account_id: Uuid) -> Result<()>
where
    I: InvoiceRepository,
    A: AccountRepository,
{
    let open = invoices.list_open_or_past_due(account_id).await?;
    if open.is_empty() {
        if let Some(account) = accounts.find_by_id(account_id).await? {
            if account.status != AccountStatus::Active {
                accounts.update_status(account_id, AccountStatus::Active).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Account, CreateAccountRequest, InvoiceStatus, Pagination,
    };
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct FakeInvoices(Mutex<Vec<Invoice>>);
    struct FakeAccounts(Mutex<Vec<Account>>);
    struct FakeNotifications(Mutex<Vec<(Uuid, NotificationKind, Uuid)>>);

    #[async_trait]
    impl InvoiceRepository for FakeInvoices {
        async fn create(&self, i: &Invoice) -> Result<Invoice> {
            self.0.lock().unwrap().push(i.clone());
            Ok(i.clone())
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Invoice>> {
            Ok(self.0.lock().unwrap().iter().find(|x| x.id == id).cloned())
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
        async fn dunning_candidates(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<Invoice>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|i| matches!(i.status, InvoiceStatus::Open | InvoiceStatus::PastDue) && i.due_date < before)
                .take(limit as usize)
                .cloned()
                .collect())
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
    impl NotificationSink for FakeNotifications {
        async fn notify(&self, account_id: Uuid, kind: NotificationKind, invoice_id: Uuid) {
            self.0.lock().unwrap().push((account_id, kind, invoice_id));
        }
    }

    fn account(id: Uuid, status: AccountStatus) -> Account {
        Account {
            id,
            email: "a@example.com".into(),
            name: "Acme".into(),
            currency: "USD".into(),
            timezone: "UTC".into(),
            tax_exempt: false,
            tax_id: None,
            vat_id: None,
            status,
            deleted_at: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn invoice(account_id: Uuid, due_date: DateTime<Utc>) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            account_id,
            subscription_id: None,
            number: "INV-000001".into(),
            status: InvoiceStatus::Open,
            amount_due: 1000,
            amount_paid: 0,
            tax: 0,
            currency: "USD".into(),
            due_date,
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

    fn controller(account: Account, invoices: Vec<Invoice>) -> DunningController<FakeInvoices, FakeAccounts, FakeNotifications> {
        DunningController::new(
            FakeInvoices(Mutex::new(invoices)),
            FakeAccounts(Mutex::new(vec![account])),
            FakeNotifications(Mutex::new(Vec::new())),
        )
    }

    #[tokio::test]
    async fn escalates_through_scenario_e_brackets() {
        let account_id = Uuid::new_v4();
        let due = Utc::now() - chrono::Duration::days(3);
        let inv = invoice(account_id, due);
        let inv_id = inv.id;
        let ctl = controller(account(account_id, AccountStatus::Active), vec![inv]);

        ctl.sweep(due + chrono::Duration::days(3), 10).await.unwrap();
        assert_eq!(ctl.accounts.find_by_id(account_id).await.unwrap().unwrap().status, AccountStatus::Active);

        ctl.sweep(due + chrono::Duration::days(7), 10).await.unwrap();
        assert_eq!(ctl.accounts.find_by_id(account_id).await.unwrap().unwrap().status, AccountStatus::Warning);

        ctl.sweep(due + chrono::Duration::days(14), 10).await.unwrap();
        assert_eq!(ctl.accounts.find_by_id(account_id).await.unwrap().unwrap().status, AccountStatus::Blocked);

        let final_invoice = ctl.invoices.find_by_id(inv_id).await.unwrap().unwrap();
        assert!(flag_set(&final_invoice, "dunning_reminder_sent"));
        assert!(flag_set(&final_invoice, "dunning_warning_sent"));
        assert!(flag_set(&final_invoice, "dunning_blocked_sent"));
    }

    #[tokio::test]
    async fn reminder_does_not_fire_twice() {
        let account_id = Uuid::new_v4();
        let due = Utc::now() - chrono::Duration::days(3);
        let inv = invoice(account_id, due);
        let ctl = controller(account(account_id, AccountStatus::Active), vec![inv]);

        ctl.sweep(due + chrono::Duration::days(3), 10).await.unwrap();
        ctl.sweep(due + chrono::Duration::days(4), 10).await.unwrap();
        assert_eq!(ctl.notifications.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reverse_clears_blocked_account_when_no_open_invoices() {
        let account_id = Uuid::new_v4();
        let accounts = FakeAccounts(Mutex::new(vec![account(account_id, AccountStatus::Blocked)]));
        let invoices = FakeInvoices(Mutex::new(Vec::new()));
        reverse_if_clear(&invoices, &accounts, account_id).await.unwrap();
        assert_eq!(accounts.find_by_id(account_id).await.unwrap().unwrap().status, AccountStatus::Active);
    }
}
