//! Switchyard - worker tier entry point

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use switchyard_common::Config;
use switchyard_core::cron::{self, cron_fn};
use switchyard_core::queue::Queue;
use switchyard_core::search::UnconfiguredSearch;
use switchyard_core::tasks;
use switchyard_core::{jobs, AssetCache, HttpClient, KvPool, ProviderRegistry, Runtime};
use switchyard_storage::DatabasePool;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config.logging.level);

    info!(instance = %config.instance_name, "starting switchyard...");

    // Connect to the database and key-value store
    let db = DatabasePool::new(&config.database).await?;
    db.health_check().await?;

    let kv = KvPool::new(&config.valkey)?;
    kv.health_check().await?;

    let http = HttpClient::new(&config.http)?;

    // Ticket provider adapters register here; deployments plug their own
    // in before the runtime is built
    let providers = ProviderRegistry::new();

    let rt = Arc::new(Runtime {
        config: config.clone(),
        db,
        kv,
        http,
        assets: AssetCache::new(),
        providers,
        search: Arc::new(UnconfiguredSearch),
    });

    // Shutdown is cooperative: closing this channel stops every cron
    // supervisor and worker after its in-flight work
    let (quit_tx, quit_rx) = watch::channel(false);

    // Start the cron supervisors
    let minute = Duration::from_secs(60);
    let mut supervisors = vec![
        cron::start(rt.clone(), "retry_errored", minute, false, cron_fn(jobs::retry_errored_messages), quit_rx.clone()),
        cron::start(rt.clone(), "timeouts", minute, false, cron_fn(jobs::timeout_sessions), quit_rx.clone()),
        cron::start(rt.clone(), "expirations", minute, false, cron_fn(jobs::expire_runs), quit_rx.clone()),
        cron::start(rt.clone(), "schedules", minute, false, cron_fn(jobs::fire_scheduled_broadcasts), quit_rx.clone()),
        cron::start(rt.clone(), "interrupts", minute * 5, false, cron_fn(jobs::interrupt_sessions), quit_rx.clone()),
    ];

    // Start the worker pools
    let registry = Arc::new(tasks::default_registry());

    let mut workers = tasks::start_workers(
        rt.clone(),
        registry.clone(),
        Queue::Batch,
        config.workers.batch_workers,
        quit_rx.clone(),
    );
    workers.extend(tasks::start_workers(
        rt.clone(),
        registry,
        Queue::Handler,
        config.workers.handler_workers,
        quit_rx,
    ));

    info!(
        batch_workers = config.workers.batch_workers,
        handler_workers = config.workers.handler_workers,
        "switchyard started"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = quit_tx.send(true);
    drop(quit_tx);

    // Give in-flight work the configured grace period to finish
    let grace = Duration::from_secs(config.workers.shutdown_grace_secs);
    supervisors.extend(workers);

    let drain = async {
        for handle in supervisors {
            let _ = handle.await;
        }
    };

    if tokio::time::timeout(grace, drain).await.is_err() {
        info!("shutdown grace period elapsed, exiting with tasks in flight");
    }

    info!("switchyard shutdown complete");

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},switchyard=debug", level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
