#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tutorly Background Worker
//!
//! Scheduled maintenance:
//! - Expired pending-action sweep (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tutorly_shared::db::create_pool;
use tutorly_shared::{EnrollmentStore, PgStore};

const WORKER_MAX_CONNECTIONS: u32 = 5;

/// Delete pending actions whose expiry has passed
///
/// Redemption already rejects expired tokens; this only keeps the table small.
async fn sweep_expired_actions(store: &dyn EnrollmentStore) {
    match store
        .purge_expired_pending_actions(OffsetDateTime::now_utc())
        .await
    {
        Ok(0) => info!("No expired pending actions"),
        Ok(count) => info!(count = count, "Purged expired pending actions"),
        Err(e) => error!(error = %e, "Failed to purge expired pending actions"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Tutorly Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, WORKER_MAX_CONNECTIONS).await?;
    info!("Database pool created");

    let store: Arc<dyn EnrollmentStore> = Arc::new(PgStore::new(pool));

    // Run once on startup so a long outage doesn't leave a backlog
    sweep_expired_actions(store.as_ref()).await;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expired pending-action sweep
    // Cron: At minute 0 of every hour
    let sweep_store = store.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let store = sweep_store.clone();
            Box::pin(async move {
                info!("Running expired pending-action sweep");
                sweep_expired_actions(store.as_ref()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Expired pending-action sweep (hourly)");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Tutorly Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
