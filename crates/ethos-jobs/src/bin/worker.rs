//! ethos-worker: runs the job engine against PostgreSQL.
//!
//! `WORKER_MODE=once` performs a single engine invocation (after one evidence
//! poll, if a feed is configured) and exits, for use under an external
//! scheduler. `WORKER_MODE=loop` (the default) runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ethos_db::{log_pool_metrics, Database, PoolConfig};
use ethos_jobs::handlers::{
    IngestHandler, NotifyConfig, NotifyHandler, ScoreHandler, SnapshotHandler, VerifyHandler,
};
use ethos_jobs::{
    EvidencePoller, JobEngine, JsonFeedAdapter, LogOnlySender, PollerConfig, PushSender,
    ScoringEngine, Stores, WebPushGateway, WorkerBuilder, WorkerConfig, WorkerEvent,
};

/// How long shutdown waits for the in-flight invocation to finish.
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "ethos_jobs=info,ethos_db=info,ethos_worker=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ethos_jobs=info,ethos_db=info,ethos_worker=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("ethos-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let worker_config = WorkerConfig::from_env();

    let db = Database::connect_with_config(
        &database_url,
        PoolConfig::for_worker(worker_config.max_concurrent_jobs),
    )
    .await
    .context("failed to connect to the database")?;
    db.migrate().await.context("failed to run migrations")?;
    log_pool_metrics(db.pool());

    let stores = db.stores();

    let sender: Arc<dyn PushSender> = match WebPushGateway::from_env()? {
        Some(gateway) => Arc::new(gateway),
        None => {
            warn!("PUSH_GATEWAY_URL not set, pushes will only be logged");
            Arc::new(LogOnlySender)
        }
    };
    let notify_config = NotifyConfig::from_env();

    let engine = build_engine(&stores, worker_config, sender, notify_config.clone());

    let mut poller = EvidencePoller::new(stores.clone(), PollerConfig::from_env());
    if let Some(feed) = JsonFeedAdapter::from_env()? {
        poller = poller.with_adapter(Arc::new(feed));
    }

    let mode = std::env::var("WORKER_MODE").unwrap_or_else(|_| "loop".to_string());
    info!(
        mode = %mode,
        worker_id = %engine.worker_id(),
        push_min_delta = notify_config.min_delta,
        evidence_feed = poller.has_adapters(),
        "Starting ethos worker"
    );

    match mode.as_str() {
        "once" => {
            if poller.has_adapters() {
                poller.poll_once().await?;
            }
            let summary = engine.run_once().await?;
            info!(?summary, "Single invocation finished");
        }
        "loop" => run_loop(engine, poller).await?,
        other => anyhow::bail!("unknown WORKER_MODE {other:?}, expected \"once\" or \"loop\""),
    }

    db.pool().close().await;
    Ok(())
}

fn build_engine(
    stores: &Stores,
    config: WorkerConfig,
    sender: Arc<dyn PushSender>,
    notify_config: NotifyConfig,
) -> JobEngine {
    let score = ScoreHandler::new(stores.clone(), ScoringEngine::default())
        .with_min_delta(notify_config.min_delta);

    WorkerBuilder::new(stores.jobs.clone())
        .with_config(config)
        .with_handler(IngestHandler::new(stores.clone()))
        .with_handler(VerifyHandler::new(stores.clone()))
        .with_handler(score)
        .with_handler(NotifyHandler::new(stores.clone(), sender).with_config(notify_config))
        .with_handler(SnapshotHandler::new(stores.clone()))
        .build()
}

async fn run_loop(engine: JobEngine, poller: EvidencePoller) -> anyhow::Result<()> {
    let poll_task = if poller.has_adapters() {
        let interval = Duration::from_secs(poller.config().poll_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = poller.poll_once().await {
                    warn!(error = %e, "Evidence poll failed");
                }
            }
        }))
    } else {
        None
    };

    let handle = engine.start();
    let mut events = handle.events();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    if let Some(task) = poll_task {
        task.abort();
    }
    handle.shutdown().await?;

    let stopped = tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::WorkerStopped) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Worker did not stop within the grace period; leases will go stale");
    }
    Ok(())
}
