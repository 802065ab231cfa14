//! Billing worker: the process that drives every periodic sweep (§4.9).
//!
//! There is no hosted scheduler runtime here — each scheduler is a plain
//! `tokio::time::interval` loop running at its own configured cadence. A
//! failing tick (a transient database hiccup, a declined payment) is logged
//! and never stops the loop; the next tick tries again.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use billing_core::gateway::{GatewayOutcome, MockPaymentGateway, PaymentGateway};
use billing_core::models::analytics::metric;
use billing_core::models::{AnalyticsSnapshot, PlanInterval};
use billing_core::repository::{
    PostgresAccountRepository, PostgresAnalyticsRepository, PostgresCreditRepository,
    PostgresInvoiceRepository, PostgresPaymentMethodRepository, PostgresPaymentRepository,
    PostgresPlanRepository, PostgresSubscriptionRepository, PostgresUsageRecordRepository,
    PostgresWebhookEndpointRepository, PostgresWebhookEventRepository,
};
use billing_core::{
    create_pool, Config, DunningController, FlatRateTaxOracle, InvoiceAssembler,
    LoggingNotificationSink, Migrator, PaymentOrchestrator, Result, SubscriptionEngine,
    UsageRecorder, WebhookDispatcher,
};

/// Drives the billing engine's periodic schedulers against a Postgres
/// database. Configuration is resolved the same way [`Config::from_env`]
/// does: `--config`, then `BILLING_CONFIG`, then the conventional paths,
/// then in-process defaults.
#[derive(Debug, Parser)]
#[command(name = "billing-worker", version = billing_core::VERSION, about = "Billing platform scheduler worker")]
struct Cli {
    /// Path to a TOML config file, overriding BILLING_CONFIG and the
    /// conventional search paths.
    #[arg(long, env = "BILLING_CONFIG")]
    config: Option<String>,

    /// Apply pending schema migrations and exit without starting the
    /// schedulers.
    #[arg(long)]
    migrate_only: bool,

    /// Run one tick of every scheduler immediately, then exit. Useful for
    /// smoke-testing a deployment without waiting out the real intervals.
    #[arg(long)]
    once: bool,
}

/// Every Postgres repository the schedulers need, bundled so each tick
/// function can clone the handful it uses out of one value. Cloning is
/// cheap: every repository here is just a `PgPool` handle.
#[derive(Clone)]
struct Repos {
    accounts: PostgresAccountRepository,
    payment_methods: PostgresPaymentMethodRepository,
    plans: PostgresPlanRepository,
    subscriptions: PostgresSubscriptionRepository,
    invoices: PostgresInvoiceRepository,
    payments: PostgresPaymentRepository,
    credits: PostgresCreditRepository,
    usage: PostgresUsageRecordRepository,
    endpoints: PostgresWebhookEndpointRepository,
    events: PostgresWebhookEventRepository,
    analytics: PostgresAnalyticsRepository,
}

/// Wraps the mock gateway behind an `Arc` so every scheduler tick shares one
/// instance instead of recreating it — the mock's at-most-one-charge replay
/// memory is keyed by idempotency key and only means anything if it
/// survives across ticks.
#[derive(Clone)]
struct SharedGateway(std::sync::Arc<MockPaymentGateway>);

#[async_trait::async_trait]
impl PaymentGateway for SharedGateway {
    async fn attempt(
        &self,
        amount: i64,
        currency: &str,
        payment_method_token: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOutcome> {
        self.0.attempt(amount, currency, payment_method_token, idempotency_key).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    init_tracing(&config);

    tracing::info!(version = billing_core::VERSION, "starting billing worker");

    let pool = create_pool(&config.database).await?;
    Migrator::new(pool.clone()).migrate().await?;

    if cli.migrate_only {
        tracing::info!("migrations applied, exiting (--migrate-only)");
        return Ok(());
    }

    let repos = Repos {
        accounts: PostgresAccountRepository::new(pool.clone()),
        payment_methods: PostgresPaymentMethodRepository::new(pool.clone()),
        plans: PostgresPlanRepository::new(pool.clone()),
        subscriptions: PostgresSubscriptionRepository::new(pool.clone()),
        invoices: PostgresInvoiceRepository::new(pool.clone()),
        payments: PostgresPaymentRepository::new(pool.clone()),
        credits: PostgresCreditRepository::new(pool.clone()),
        usage: PostgresUsageRecordRepository::new(pool.clone()),
        endpoints: PostgresWebhookEndpointRepository::new(pool.clone()),
        events: PostgresWebhookEventRepository::new(pool.clone()),
        analytics: PostgresAnalyticsRepository::new(pool.clone()),
    };
    let gateway = SharedGateway(std::sync::Arc::new(MockPaymentGateway::default()));

    if cli.once {
        run_all_once(&repos, &config, &gateway).await;
        return Ok(());
    }

    let schedulers = &config.schedulers;
    let mut handles = Vec::new();

    handles.push(spawn_scheduler("billing_cycle", schedulers.billing_cycle_interval_secs, {
        let repos = repos.clone();
        let gateway = gateway.clone();
        let fallback_rate = config.tax_oracle.fallback_rate;
        let batch_size = schedulers.batch_size;
        move || tick_billing_cycle(repos.clone(), gateway.clone(), fallback_rate, batch_size)
    }));

    handles.push(spawn_scheduler("trial_expiry", schedulers.trial_expiry_interval_secs, {
        let repos = repos.clone();
        let batch_size = schedulers.batch_size;
        move || tick_trial_expiry(repos.clone(), batch_size)
    }));

    handles.push(spawn_scheduler("plan_change_apply", schedulers.plan_change_apply_interval_secs, {
        let repos = repos.clone();
        let batch_size = schedulers.batch_size;
        move || tick_plan_change_apply(repos.clone(), batch_size)
    }));

    handles.push(spawn_scheduler("payment_retry", schedulers.payment_retry_interval_secs, {
        let repos = repos.clone();
        let gateway = gateway.clone();
        let batch_size = schedulers.batch_size;
        move || tick_payment_retry(repos.clone(), gateway.clone(), batch_size)
    }));

    handles.push(spawn_scheduler("dunning_sweep", schedulers.dunning_sweep_interval_secs, {
        let repos = repos.clone();
        let batch_size = schedulers.batch_size;
        move || tick_dunning_sweep(repos.clone(), batch_size)
    }));

    handles.push(spawn_scheduler("late_usage", schedulers.late_usage_interval_secs, {
        let repos = repos.clone();
        let fallback_rate = config.tax_oracle.fallback_rate;
        let lookback_secs = schedulers.late_usage_interval_secs;
        let batch_size = schedulers.batch_size;
        move || tick_late_usage(repos.clone(), fallback_rate, lookback_secs, batch_size)
    }));

    handles.push(spawn_scheduler("pause_auto", schedulers.pause_auto_interval_secs, {
        let repos = repos.clone();
        let batch_size = schedulers.batch_size;
        move || tick_pause_auto(repos.clone(), batch_size)
    }));

    handles.push(spawn_scheduler("webhook_dispatch", schedulers.webhook_dispatch_interval_secs, {
        let events = repos.events.clone();
        let webhooks = config.webhooks.clone();
        let batch_size = schedulers.batch_size;
        move || tick_webhook_dispatch(events.clone(), webhooks.clone(), batch_size)
    }));

    handles.push(spawn_scheduler("analytics_rollup", schedulers.analytics_rollup_interval_secs, {
        let repos = repos.clone();
        move || tick_analytics_rollup(repos.clone())
    }));

    handles.push(spawn_scheduler(
        "churn_ltv_rollup",
        schedulers.churn_ltv_rollup_interval_secs,
        {
            let repos = repos.clone();
            let lookback_secs = schedulers.churn_ltv_rollup_interval_secs;
            move || tick_churn_ltv_rollup(repos.clone(), lookback_secs)
        },
    ));

    tracing::info!(count = handles.len(), "all schedulers running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping schedulers");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Spawns one polling-interval task. `missed tick` behaviour is `Delay`
/// rather than the default `Burst`: a scheduler that falls behind (e.g. the
/// process was paused) catches up one tick at a time instead of firing a
/// backlog of ticks back-to-back.
fn spawn_scheduler<F, Fut>(name: &'static str, interval_secs: u64, mut tick: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = tick().await {
                tracing::warn!(scheduler = name, error = %err, category = err.category(), "scheduler tick failed");
            }
        }
    })
}

async fn run_all_once(repos: &Repos, config: &Config, gateway: &SharedGateway) {
    let batch_size = config.schedulers.batch_size;
    let ticks: Vec<(&str, Result<()>)> = vec![
        (
            "billing_cycle",
            tick_billing_cycle(repos.clone(), gateway.clone(), config.tax_oracle.fallback_rate, batch_size).await,
        ),
        ("trial_expiry", tick_trial_expiry(repos.clone(), batch_size).await),
        ("plan_change_apply", tick_plan_change_apply(repos.clone(), batch_size).await),
        ("payment_retry", tick_payment_retry(repos.clone(), gateway.clone(), batch_size).await),
        ("dunning_sweep", tick_dunning_sweep(repos.clone(), batch_size).await),
        (
            "late_usage",
            tick_late_usage(repos.clone(), config.tax_oracle.fallback_rate, config.schedulers.late_usage_interval_secs, batch_size).await,
        ),
        ("pause_auto", tick_pause_auto(repos.clone(), batch_size).await),
        ("webhook_dispatch", tick_webhook_dispatch(repos.events.clone(), config.webhooks.clone(), batch_size).await),
        ("analytics_rollup", tick_analytics_rollup(repos.clone()).await),
        (
            "churn_ltv_rollup",
            tick_churn_ltv_rollup(repos.clone(), config.schedulers.churn_ltv_rollup_interval_secs).await,
        ),
    ];
    for (name, outcome) in ticks {
        match outcome {
            Ok(()) => tracing::info!(scheduler = name, "tick complete"),
            Err(err) => tracing::warn!(scheduler = name, error = %err, "tick failed"),
        }
    }
}

fn invoice_assembler(
    repos: &Repos,
    fallback_rate: f64,
) -> InvoiceAssembler<
    PostgresInvoiceRepository,
    PostgresSubscriptionRepository,
    PostgresPlanRepository,
    PostgresAccountRepository,
    PostgresUsageRecordRepository,
    PostgresCreditRepository,
    PostgresWebhookEndpointRepository,
    PostgresWebhookEventRepository,
    FlatRateTaxOracle,
> {
    InvoiceAssembler::new(
        repos.invoices.clone(),
        repos.subscriptions.clone(),
        repos.plans.clone(),
        repos.accounts.clone(),
        repos.usage.clone(),
        repos.credits.clone(),
        repos.endpoints.clone(),
        repos.events.clone(),
        FlatRateTaxOracle { rate: fallback_rate },
    )
}

fn subscription_engine(
    repos: &Repos,
) -> SubscriptionEngine<
    PostgresSubscriptionRepository,
    PostgresPlanRepository,
    PostgresAccountRepository,
    PostgresWebhookEndpointRepository,
    PostgresWebhookEventRepository,
> {
    SubscriptionEngine::new(
        repos.subscriptions.clone(),
        repos.plans.clone(),
        repos.accounts.clone(),
        repos.endpoints.clone(),
        repos.events.clone(),
    )
}

fn payment_orchestrator(
    repos: &Repos,
    gateway: SharedGateway,
) -> PaymentOrchestrator<
    PostgresPaymentRepository,
    PostgresInvoiceRepository,
    PostgresAccountRepository,
    PostgresSubscriptionRepository,
    PostgresWebhookEndpointRepository,
    PostgresWebhookEventRepository,
    SharedGateway,
> {
    PaymentOrchestrator::new(
        repos.payments.clone(),
        repos.invoices.clone(),
        repos.accounts.clone(),
        repos.subscriptions.clone(),
        repos.endpoints.clone(),
        repos.events.clone(),
        gateway,
    )
}

/// §4.9 `billing_cycle`: generates the regular invoice for every
/// subscription whose period has closed, attempts payment against the
/// account's default payment method when one is on file, then advances the
/// subscription into its next period regardless of whether payment
/// succeeded — a failed charge is the Payment Orchestrator and Dunning
/// Controller's problem, not a reason to stall billing.
async fn tick_billing_cycle(repos: Repos, gateway: SharedGateway, fallback_rate: f64, batch_size: i64) -> Result<()> {
    let now = Utc::now();
    let due = repos.subscriptions.due_for_billing(now, batch_size).await?;
    if due.is_empty() {
        return Ok(());
    }

    let assembler = invoice_assembler(&repos, fallback_rate);
    let orchestrator = payment_orchestrator(&repos, gateway);
    let engine = subscription_engine(&repos);

    for subscription in due {
        let invoice = match assembler.generate(subscription.id).await {
            Ok(invoice) => invoice,
            Err(err) => {
                tracing::warn!(subscription_id = %subscription.id, error = %err, "billing cycle invoice generation failed");
                continue;
            }
        };

        if invoice.balance_due() > 0 {
            if let Ok(Some(method)) = repos.payment_methods.find_default(subscription.account_id).await {
                if let Err(err) = orchestrator.attempt(&invoice, &method, None).await {
                    tracing::warn!(invoice_id = %invoice.id, error = %err, "billing cycle payment attempt failed");
                }
            } else {
                tracing::warn!(account_id = %subscription.account_id, "no default payment method on file");
            }
        }

        if let Some(plan) = repos.plans.find_by_id(subscription.plan_id).await? {
            if let Err(err) = engine.advance_period(subscription.id, plan.interval).await {
                tracing::warn!(subscription_id = %subscription.id, error = %err, "failed to advance billing period");
            }
        }
    }

    Ok(())
}

/// §4.9 `trial_expiry`: converts every subscription whose trial has ended
/// into an active one. Invoicing that period is the next `billing_cycle`
/// tick's job, same as any other active subscription.
async fn tick_trial_expiry(repos: Repos, batch_size: i64) -> Result<()> {
    let now = Utc::now();
    let expired = repos.subscriptions.trialing_expired(now, batch_size).await?;
    if expired.is_empty() {
        return Ok(());
    }

    let engine = subscription_engine(&repos);
    for subscription in expired {
        if let Err(err) = engine.activate_from_trial(subscription.id).await {
            tracing::warn!(subscription_id = %subscription.id, error = %err, "trial activation failed");
        }
    }
    Ok(())
}

/// §4.9 `plan_change_apply`: swaps in a deferred plan change once the
/// subscription's current period has closed. No proration is produced here
/// — proration only applies to immediate changes, handled synchronously at
/// request time (§4.3).
async fn tick_plan_change_apply(repos: Repos, batch_size: i64) -> Result<()> {
    let now = Utc::now();
    let due = repos.subscriptions.pending_plan_change_due(now, batch_size).await?;
    if due.is_empty() {
        return Ok(());
    }

    let engine = subscription_engine(&repos);
    for subscription in due {
        if let Err(err) = engine.apply_pending_plan_change(subscription.id).await {
            tracing::warn!(subscription_id = %subscription.id, error = %err, "pending plan change apply failed");
        }
    }
    Ok(())
}

/// §4.9 `payment_retry`: re-attempts every payment whose retry schedule has
/// come due. Payments with no payment method on record (deleted since the
/// original attempt) are skipped rather than retried against nothing.
async fn tick_payment_retry(repos: Repos, gateway: SharedGateway, batch_size: i64) -> Result<()> {
    let now = Utc::now();
    let due = repos.payments.due_for_retry(now, batch_size).await?;
    if due.is_empty() {
        return Ok(());
    }

    let orchestrator = payment_orchestrator(&repos, gateway);
    for payment in due {
        let Some(method_id) = payment.payment_method_id else {
            tracing::warn!(payment_id = %payment.id, "payment has no payment method to retry against");
            continue;
        };
        let method = match repos.payment_methods.find_by_id(method_id).await? {
            Some(method) => method,
            None => {
                tracing::warn!(payment_id = %payment.id, "payment method no longer exists");
                continue;
            }
        };
        if let Err(err) = orchestrator.retry(payment.id, &method).await {
            tracing::warn!(payment_id = %payment.id, error = %err, "payment retry failed");
        }
    }
    Ok(())
}

/// §4.9 `dunning_sweep`: escalates every overdue invoice by days-past-due
/// bracket (§4.6).
async fn tick_dunning_sweep(repos: Repos, batch_size: i64) -> Result<()> {
    let controller = DunningController::new(repos.invoices.clone(), repos.accounts.clone(), LoggingNotificationSink);
    let count = controller.sweep(Utc::now(), batch_size).await?;
    if count > 0 {
        tracing::info!(count, "dunning sweep escalated invoices");
    }
    Ok(())
}

/// §4.9 `late_usage`: for every invoice whose period closed within the
/// lookback window, finds usage that arrived after the cutoff and bills it
/// on a fresh supplemental invoice, grouped by metric (§4.7).
async fn tick_late_usage(repos: Repos, fallback_rate: f64, lookback_secs: u64, batch_size: i64) -> Result<()> {
    let since = Utc::now() - Duration::seconds(lookback_secs as i64);
    let closed = repos.invoices.recently_closed(since, batch_size).await?;
    if closed.is_empty() {
        return Ok(());
    }

    let recorder = UsageRecorder::new(repos.usage.clone(), repos.subscriptions.clone());
    let assembler = invoice_assembler(&repos, fallback_rate);

    for invoice in closed {
        let (Some(subscription_id), Some(period_start), Some(period_end)) =
            (invoice.subscription_id, invoice.period_start, invoice.period_end)
        else {
            continue;
        };

        let late = match recorder.late_usage(subscription_id, period_start, period_end).await {
            Ok(late) => late,
            Err(err) => {
                tracing::warn!(invoice_id = %invoice.id, error = %err, "late usage lookup failed");
                continue;
            }
        };
        if late.is_empty() {
            continue;
        }

        let mut by_metric: std::collections::BTreeMap<String, i64> = std::collections::BTreeMap::new();
        for record in late {
            *by_metric.entry(record.metric).or_insert(0) += record.quantity;
        }

        for (metric, quantity) in by_metric {
            if let Err(err) = assembler.create_supplemental_invoice(subscription_id, &metric, quantity).await {
                tracing::warn!(subscription_id = %subscription_id, metric, error = %err, "supplemental invoice failed");
            }
        }
    }

    Ok(())
}

/// §4.9 `pause_auto`: resumes every subscription whose pause window has
/// elapsed, and cancels subscriptions left paused indefinitely past the
/// stale threshold the repository query enforces.
async fn tick_pause_auto(repos: Repos, batch_size: i64) -> Result<()> {
    let now = Utc::now();
    let engine = subscription_engine(&repos);

    let resumable = repos.subscriptions.paused_resumable(now, batch_size).await?;
    for subscription in resumable {
        if let Err(err) = engine.resume(subscription.id).await {
            tracing::warn!(subscription_id = %subscription.id, error = %err, "auto-resume failed");
        }
    }

    let stale = repos.subscriptions.paused_stale(now, batch_size).await?;
    for subscription in stale {
        if let Err(err) = engine.cancel(subscription.id, true).await {
            tracing::warn!(subscription_id = %subscription.id, error = %err, "stale pause cancel failed");
        }
    }

    Ok(())
}

/// §4.9 `webhook_dispatch`: drains pending outbox rows over HTTP.
async fn tick_webhook_dispatch(
    events: PostgresWebhookEventRepository,
    webhooks: billing_core::config::WebhookConfig,
    batch_size: i64,
) -> Result<()> {
    let dispatcher = WebhookDispatcher::new(
        events,
        webhooks.delivery_timeout_secs,
        webhooks.max_retries,
        webhooks.backoff_minutes,
        webhooks.signing_secret,
    );
    let report = dispatcher.dispatch_once(batch_size).await?;
    if report.delivered > 0 || report.retried > 0 || report.failed_terminal > 0 {
        tracing::info!(
            delivered = report.delivered,
            retried = report.retried,
            failed_terminal = report.failed_terminal,
            "webhook dispatch pass complete"
        );
    }
    Ok(())
}

/// §4.9 `analytics_rollup`: recomputes MRR from the currently billable
/// subscription count. [`PostgresSubscriptionRepository::billable_count`]
/// intentionally returns raw `(plan_id, quantity)` pairs rather than a
/// currency-weighted total — it has no opinion on price, only on which
/// subscriptions count — so the multiplication by `plan.amount` happens
/// here. Annual plans are normalized to a monthly figure by dividing by 12,
/// matching MRR's definition as a monthly metric.
async fn tick_analytics_rollup(repos: Repos) -> Result<()> {
    let counts = repos.subscriptions.billable_count().await?;
    let mut mrr: i64 = 0;
    for (plan_id, quantity) in counts {
        let Some(plan) = repos.plans.find_by_id(plan_id).await? else {
            continue;
        };
        let monthly_amount = match plan.interval {
            PlanInterval::Month => plan.amount,
            PlanInterval::Year => plan.amount / 12,
        };
        mrr += monthly_amount * quantity;
    }

    let today = Utc::now().date_naive();
    repos
        .analytics
        .upsert(&AnalyticsSnapshot {
            metric_name: metric::MRR.to_string(),
            period: today,
            value: mrr,
            metadata: serde_json::json!({}),
        })
        .await?;

    tracing::info!(mrr, "analytics rollup recorded MRR snapshot");
    Ok(())
}

/// §4.9 `analytics_rollup` (churn, LTV leg): runs on its own, slower
/// cadence. Churn is the count of subscriptions cancelled within the
/// lookback window; LTV is total revenue collected divided by the number
/// of accounts currently holding a subscription — a simple average rather
/// than a cohort-based projection, matching what the source system
/// reports under the same metric name.
async fn tick_churn_ltv_rollup(repos: Repos, lookback_secs: u64) -> Result<()> {
    let since = Utc::now() - Duration::seconds(lookback_secs as i64);
    let churned = repos.subscriptions.churned_since(since).await?;
    let today = Utc::now().date_naive();

    repos
        .analytics
        .upsert(&AnalyticsSnapshot {
            metric_name: metric::CHURN_COUNT.to_string(),
            period: today,
            value: churned,
            metadata: serde_json::json!({ "window_secs": lookback_secs }),
        })
        .await?;

    let total_collected = repos.invoices.total_collected().await?;
    let active_accounts = repos.subscriptions.active_account_count().await?;
    let ltv = if active_accounts > 0 { total_collected / active_accounts } else { 0 };

    repos
        .analytics
        .upsert(&AnalyticsSnapshot {
            metric_name: metric::LTV.to_string(),
            period: today,
            value: ltv,
            metadata: serde_json::json!({ "total_collected": total_collected, "active_accounts": active_accounts }),
        })
        .await?;

    tracing::info!(churned, ltv, active_accounts, "churn/LTV rollup recorded");
    Ok(())
}
