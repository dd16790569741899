//! Swapdeck Background Worker
//!
//! Scheduled jobs:
//! - Subscription credit expiration sweep (hourly)
//! - Processed webhook event pruning (daily at 3:00 UTC)
//! - Ledger invariant checks (daily at 4:00 UTC)
//! - Health check heartbeat (every 5 minutes)

use swapdeck_ledger::{BalanceService, InvariantChecker, SubscriptionCreditService};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How long processed webhook audit rows are kept before pruning
const WEBHOOK_EVENT_RETENTION_DAYS: i32 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting swapdeck worker");

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = swapdeck_shared::db::create_pool(&database_url).await?;
    info!("Database pool created");

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire subscription credits whose period has ended.
    // The sweep is idempotent and per-user, so overlapping or repeated
    // runs are harmless.
    let sweep_service = SubscriptionCreditService::new(pool.clone());
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = sweep_service.clone();
            Box::pin(async move {
                info!("Running subscription credit expiration sweep");
                match service.expire_credits().await {
                    Ok(result) => {
                        info!(
                            expired_count = result.expired_count,
                            affected_users = result.affected_users.len(),
                            "Expiration sweep complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Expiration sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription credit expiration sweep (hourly)");

    // Job 2: Prune old processed webhook audit rows (daily at 3:00 UTC).
    // Unresolved rows are kept for manual reconciliation.
    let prune_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = prune_pool.clone();
            Box::pin(async move {
                info!("Pruning processed webhook events");
                let result = sqlx::query(
                    r#"
                    DELETE FROM stripe_webhook_events
                    WHERE processing_result NOT IN ('unresolved', 'error')
                      AND created_at < NOW() - make_interval(days => $1)
                    "#,
                )
                .bind(WEBHOOK_EVENT_RETENTION_DAYS)
                .execute(&pool)
                .await;
                match result {
                    Ok(done) => {
                        info!(deleted = done.rows_affected(), "Webhook event prune complete");
                    }
                    Err(e) => {
                        warn!(error = %e, "Webhook event prune failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event prune (daily at 3:00 UTC)");

    // Job 3: Run the ledger invariant checks and log any violations
    // (daily at 4:00 UTC). Cached-balance drift is self-healing via
    // recalculation; everything else is log-and-investigate.
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone());
            let balance = BalanceService::new(invariant_pool.clone());
            Box::pin(async move {
                info!("Running ledger invariant checks");
                let summary = match checker.run_all_checks().await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(error = %e, "Ledger invariant checks failed to run");
                        return;
                    }
                };

                if summary.healthy {
                    info!(
                        checks_run = summary.checks_run,
                        "Ledger invariant checks passed"
                    );
                    return;
                }

                for violation in &summary.violations {
                    error!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        description = %violation.description,
                        "Ledger invariant violated"
                    );
                    if violation.invariant == "cached_balance_consistency" {
                        for user_id in &violation.user_ids {
                            match balance.recalculate_balance(*user_id).await {
                                Ok(row) => {
                                    info!(
                                        user_id = %user_id,
                                        balance = row.balance,
                                        "Repaired cached balance"
                                    );
                                }
                                Err(e) => {
                                    error!(
                                        user_id = %user_id,
                                        error = %e,
                                        "Failed to repair cached balance"
                                    );
                                }
                            }
                        }
                    }
                }
                error!(
                    checks_failed = summary.checks_failed,
                    violations = summary.violations.len(),
                    "Ledger invariant checks found violations"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (daily at 4:00 UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Park the main task; the scheduler runs on its own tasks
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
