//! QuotaSync Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription resync from the billing provider (every 6 hours by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use quotasync_billing::{run_migrations, BillingConfig, BillingService, ResyncResult};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RESYNC_CRON: &str = "0 0 */6 * * *";

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a resync cycle
fn log_resync_results(results: &[ResyncResult]) {
    let synced = results
        .iter()
        .filter(|r| matches!(r, ResyncResult::Synced { .. }))
        .count();
    let not_found = results
        .iter()
        .filter(|r| matches!(r, ResyncResult::NotFound { .. }))
        .count();
    let errors = results
        .iter()
        .filter(|r| matches!(r, ResyncResult::Error { .. }))
        .count();

    info!(
        synced = synced,
        not_found = not_found,
        errors = errors,
        "Subscription resync cycle complete"
    );

    for result in results {
        match result {
            ResyncResult::NotFound { organization_id } => {
                warn!(org_id = %organization_id, "Provider has no subscription for organization");
            }
            ResyncResult::Error {
                organization_id,
                error,
            } => {
                error!(org_id = %organization_id, error = %error, "Failed to resync subscription");
            }
            ResyncResult::Synced { .. } => {}
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

    info!("Starting QuotaSync Worker");

    let pool = create_db_pool().await?;
    run_migrations(&pool).await?;

    let config = BillingConfig::from_env()?;
    info!(api_url = %config.api_url, meter = %config.meter_slug, "Billing configuration loaded");
    let billing = Arc::new(BillingService::from_config(&config, pool)?);

    let resync_cron = std::env::var("BILLING_RESYNC_CRON")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RESYNC_CRON.to_string());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Resync every stored subscription from the provider
    let resync_billing = billing.clone();
    scheduler
        .add(Job::new_async(resync_cron.as_str(), move |_uuid, _l| {
            let billing = resync_billing.clone();
            Box::pin(async move {
                info!("Running scheduled subscription resync");
                match billing.resync_all().await {
                    Ok(results) => log_resync_results(&results),
                    Err(e) => error!(error = %e, "Subscription resync failed to start"),
                }
            })
        })?)
        .await?;
    info!(cron = %resync_cron, "Scheduled: Subscription resync");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("QuotaSync Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
