#![cfg_attr(test, allow(clippy::unwrap_used))]

//! RegDesk Background Worker
//!
//! Handles scheduled jobs including:
//! - Finalizing cancellations whose billing period has ended (hourly)
//! - Billing invariant checks (daily at 4:30 AM UTC)
//! - Heartbeat logging (every 5 minutes)

use std::sync::Arc;

use anyhow::Context;
use regdesk_billing::{
    BillingService, FinalizerReport, InvariantCheckSummary, InvariantChecker,
    SubscriptionFinalizer, ViolationSeverity,
};
use regdesk_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_FINALIZER_CRON: &str = "0 0 * * * *";
const DEFAULT_INVARIANTS_CRON: &str = "0 30 4 * * *";

/// Worker settings loaded from the environment
#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    finalizer_cron: String,
    invariants_cron: String,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            finalizer_cron: std::env::var("FINALIZER_CRON")
                .unwrap_or_else(|_| DEFAULT_FINALIZER_CRON.to_string()),
            invariants_cron: std::env::var("INVARIANTS_CRON")
                .unwrap_or_else(|_| DEFAULT_INVARIANTS_CRON.to_string()),
        })
    }
}

/// One finalizer sweep; a failed sweep is logged and retried on the next tick
async fn run_finalizer_sweep(
    finalizer: &SubscriptionFinalizer,
    now: OffsetDateTime,
) -> Option<FinalizerReport> {
    match finalizer.run(now).await {
        Ok(report) => {
            log_finalizer_report(&report);
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Failed to list expired cancellations");
            None
        }
    }
}

fn log_finalizer_report(report: &FinalizerReport) {
    if report.errors > 0 {
        warn!(
            found = report.found,
            finalized = report.finalized,
            skipped = report.skipped,
            errors = report.errors,
            "Cancellation finalizer completed with errors"
        );
    } else {
        info!(
            found = report.found,
            finalized = report.finalized,
            skipped = report.skipped,
            "Cancellation finalizer complete"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariants healthy"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting RegDesk Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Move expired `canceling` subscriptions to `canceled`
    let finalizer = billing.finalizer.clone();
    scheduler
        .add(Job::new_async(
            config.finalizer_cron.as_str(),
            move |_uuid, _l| {
                let finalizer = finalizer.clone();
                Box::pin(async move {
                    info!("Running cancellation finalizer");
                    run_finalizer_sweep(&finalizer, OffsetDateTime::now_utc()).await;
                })
            },
        )?)
        .await?;
    info!(cron = %config.finalizer_cron, "Scheduled: Cancellation finalizer");

    // Job 2: Billing invariant checks
    let checker = InvariantChecker::new(pool.clone(), billing.catalog().clone());
    scheduler
        .add(Job::new_async(
            config.invariants_cron.as_str(),
            move |_uuid, _l| {
                let checker = checker.clone();
                Box::pin(async move {
                    info!("Running billing invariant checks");
                    match checker.run_all_checks().await {
                        Ok(summary) => log_invariant_summary(&summary),
                        Err(e) => error!(error = %e, "Billing invariant checks failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.invariants_cron, "Scheduled: Billing invariant checks");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Catch up on cancellations that expired while the worker was down
    run_finalizer_sweep(&billing.finalizer, OffsetDateTime::now_utc()).await;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("RegDesk Worker started with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use regdesk_billing::{BillingStore, InMemoryBillingStore, Subscription};
    use regdesk_shared::{PlanTier, SubscriptionStatus};
    use time::Duration;
    use uuid::Uuid;

    use super::*;

    fn canceling(org_id: Uuid, period_start: OffsetDateTime) -> Subscription {
        let mut sub = Subscription::new_period(
            org_id,
            PlanTier::Standard,
            5000,
            1900,
            "usd",
            period_start,
            30,
        );
        sub.status = SubscriptionStatus::Canceling;
        sub.canceled_at = Some(period_start + Duration::days(3));
        sub
    }

    #[tokio::test]
    async fn test_finalizer_sweep_only_touches_expired_rows() {
        let store = InMemoryBillingStore::new();
        let now = OffsetDateTime::now_utc();
        let expired_org = Uuid::new_v4();
        let current_org = Uuid::new_v4();
        store
            .seed_subscription(canceling(expired_org, now - Duration::days(45)))
            .await;
        store
            .seed_subscription(canceling(current_org, now - Duration::days(10)))
            .await;

        let finalizer =
            SubscriptionFinalizer::new(Arc::new(store.clone()) as Arc<dyn BillingStore>);
        let report = run_finalizer_sweep(&finalizer, now).await.unwrap();

        assert_eq!(report.found, 1);
        assert_eq!(report.finalized, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(
            store.subscriptions_for(expired_org).await[0].status,
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            store.subscriptions_for(current_org).await[0].status,
            SubscriptionStatus::Canceling
        );

        // A second sweep finds nothing left to do
        let report = run_finalizer_sweep(&finalizer, now).await.unwrap();
        assert_eq!(report, FinalizerReport::default());
    }

    #[tokio::test]
    async fn test_default_schedules_parse() {
        for cron in [DEFAULT_FINALIZER_CRON, DEFAULT_INVARIANTS_CRON] {
            assert!(
                Job::new_async(cron, |_uuid, _l| Box::pin(async {})).is_ok(),
                "{cron} should be a valid schedule"
            );
        }
    }
}
