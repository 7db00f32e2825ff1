//! Classloop Background Worker
//!
//! Handles scheduled billing jobs:
//! - Member graduation processing (daily at 2:00 UTC)
//! - Account deletion warnings (daily at 2:30 UTC)
//! - Account deletions past the grace period (daily at 3:00 UTC)
//! - Billing invariant sweep (daily at 5:00 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use classloop_billing::store::postgres::{
    run_migrations, PgBillingStore, PgLifecycleStore, PgMemberDirectory, PgNotificationOutbox,
    PgSchoolStore,
};
use classloop_billing::{BillingConfig, InvariantChecker, JobSummary, LifecycleService};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn log_job_result(job: &str, result: Result<JobSummary, classloop_billing::BillingError>) {
    match result {
        Ok(summary) => {
            if summary.failed > 0 {
                error!(
                    job = job,
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "Job finished with failures"
                );
            } else {
                info!(
                    job = job,
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    "Job finished"
                );
            }
        }
        Err(e) => error!(job = job, error = %e, "Job aborted"),
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

    info!("Starting Classloop Worker");

    let pool = create_db_pool().await?;
    run_migrations(&pool).await?;

    let config = BillingConfig::from_env();
    let lifecycle = LifecycleService::new(
        Arc::new(PgSchoolStore::new(pool.clone())),
        Arc::new(PgLifecycleStore::new(pool.clone())),
        Arc::new(PgMemberDirectory::new(pool.clone())),
        Arc::new(PgNotificationOutbox::new(pool.clone())),
        config,
    );
    let invariants = InvariantChecker::new(
        Arc::new(PgSchoolStore::new(pool.clone())),
        Arc::new(PgBillingStore::new(pool.clone())),
        Arc::new(PgMemberDirectory::new(pool.clone())),
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Graduation processing (daily at 2:00 UTC)
    let graduation_service = lifecycle.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let service = graduation_service.clone();
            Box::pin(async move {
                info!("Running graduation job");
                let now = time::OffsetDateTime::now_utc();
                log_job_result("graduation", service.run_graduation(now).await);
            })
        })?)
        .await?;
    info!("Scheduled: Graduation processing (daily at 2:00 UTC)");

    // Job 2: Deletion warnings (daily at 2:30 UTC)
    let warning_service = lifecycle.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let service = warning_service.clone();
            Box::pin(async move {
                info!("Running deletion warning job");
                let now = time::OffsetDateTime::now_utc();
                log_job_result("deletion_warnings", service.run_warnings(now).await);
            })
        })?)
        .await?;
    info!("Scheduled: Deletion warnings (daily at 2:30 UTC)");

    // Job 3: Account deletions (daily at 3:00 UTC)
    // Runs after warnings so nothing is ever deleted in the same cycle it
    // first becomes due without having been warned.
    let deletion_service = lifecycle.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let service = deletion_service.clone();
            Box::pin(async move {
                info!("Running account deletion job");
                let now = time::OffsetDateTime::now_utc();
                log_job_result("account_deletions", service.run_deletions(now).await);
            })
        })?)
        .await?;
    info!("Scheduled: Account deletions (daily at 3:00 UTC)");

    // Job 4: Billing invariant sweep (daily at 5:00 UTC)
    let invariant_checker = invariants.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All billing invariants hold");
                    }
                    Ok(summary) => {
                        for v in &summary.violations {
                            error!(
                                invariant = %v.invariant,
                                school_id = %v.school_id,
                                severity = %v.severity,
                                description = %v.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            violations = summary.violations.len(),
                            "Billing invariant sweep found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant sweep failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant sweep (daily at 5:00 UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started; all jobs scheduled");

    // Keep the worker alive.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
