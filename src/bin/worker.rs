//! Composition root for the gateway's background worker process.
//!
//! Wires every component declared in `gateway_core` into one running
//! process: loads `GatewayConfig`, connects Postgres/Redis/NATS,
//! constructs each service, and spawns its periodic background loop
//! behind a shared `CancellationToken` cancelled on Ctrl+C. Grounded on
//! `examples/castingclouds-circuit-breaker/src/bin/server.rs`'s startup sequence (`dotenv` then
//! `tracing_subscriber::fmt::init`, then build-and-run), trimmed of its
//! GraphQL/HTTP concerns since the worker owns no request surface of
//! its own — the HTTP layer is explicitly out of scope (spec.md's
//! "Explicitly OUT OF SCOPE" list).

use std::sync::Arc;

use clap::Parser;
use gateway_core::cache::{CacheManager, DistributedTier};
use gateway_core::config::GatewayConfig;
use gateway_core::events::GatewayEvents;
use gateway_core::lock::PgAdvisoryLock;
use gateway_core::media::{MediaStore, S3MediaStore};
use gateway_core::models::router::RouterConfig;
use gateway_core::monitoring::{AudioAlertEngine, CacheMonitor};
use gateway_core::provider_errors::ErrorTracker;
use gateway_core::providers::ProviderRegistry;
use gateway_core::realtime::RealtimeSessionStore;
use gateway_core::router::Router;
use gateway_core::tasks::{AsyncTaskEngine, InMemoryTaskStore, PostgresTaskStore, TaskStore};
use gateway_core::tracing_svc::TracingService;
use gateway_core::video::VideoOrchestrator;
use gateway_core::webhook::{BatchingPublisher, DeliveryTracker, WebhookCircuitBreaker, WebhookNotifier};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI overrides layered on top of `GatewayConfig::load()`'s
/// file/environment sources, for the knob an operator most often needs
/// to flip at launch without editing `config/gateway.toml`.
#[derive(Parser, Debug)]
#[command(name = "gateway-worker", about = "Background worker for core gateway services")]
struct Args {
    /// Skip the Postgres connection and run with an in-memory task
    /// store. Useful for local development without a database.
    #[arg(long, env = "GATEWAY_IN_MEMORY", default_value_t = false)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = GatewayConfig::load()?;

    info!("starting gateway worker");

    let events = GatewayEvents::connect(&config.nats_url).await;

    let distributed_tier = match DistributedTier::new(&config.redis_url) {
        Ok(tier) => Some(tier),
        Err(err) => {
            warn!(%err, "could not reach redis, running without a distributed cache tier");
            None
        }
    };
    let distributed_arc = distributed_tier.clone().map(Arc::new);

    let cache = Arc::new(CacheManager::new(distributed_tier, Some(events.clone())));
    let _error_tracker = Arc::new(ErrorTracker::new(Some(events.clone())));
    let providers = Arc::new(ProviderRegistry::new());
    let router = Arc::new(Router::new(RouterConfig::default(), config.router.clone(), providers.clone()));
    let tracing_service = Arc::new(TracingService::new(config.tracing.clone()));
    let realtime = Arc::new(RealtimeSessionStore::new());

    let cache_monitor = Arc::new(CacheMonitor::new(cache.clone(), config.monitoring.clone(), Some(events.clone())));
    let alert_engine = Arc::new(AudioAlertEngine::new(config.alerting.clone()));

    let cancel = CancellationToken::new();

    let circuit_breaker = Arc::new(WebhookCircuitBreaker::new(distributed_arc));
    let delivery_tracker = Arc::new(DeliveryTracker::new());
    let webhook_notifier = Arc::new(WebhookNotifier::new());
    let _publisher = BatchingPublisher::spawn(
        config.batching.clone(),
        circuit_breaker,
        delivery_tracker,
        webhook_notifier,
        cancel.clone(),
    );

    let media = Arc::new(S3MediaStore::new(config.s3.clone()).await) as Arc<dyn MediaStore>;

    run_background_loops(cache_monitor, alert_engine, tracing_service, realtime, &config, cancel.clone());

    if args.in_memory {
        info!("running with in-memory task store (--in-memory)");
        let tasks = Arc::new(AsyncTaskEngine::new(InMemoryTaskStore::new(), config.tasks.clone(), Some(events.clone())));
        let _video = Arc::new(VideoOrchestrator::new(router, providers, media, tasks.clone(), Some(events)));
        spawn_retry_sweep(tasks, cancel.clone());
    } else {
        let pool = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
        let _advisory_lock = PgAdvisoryLock::new(pool.clone());
        let tasks = Arc::new(AsyncTaskEngine::new(PostgresTaskStore::new(pool), config.tasks.clone(), Some(events.clone())));
        let _video = Arc::new(VideoOrchestrator::new(router, providers, media, tasks.clone(), Some(events)));
        spawn_retry_sweep(tasks, cancel.clone());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    Ok(())
}

/// Periodically sweeps tasks due for retry. Re-dispatching a swept
/// task to its owning orchestrator is integration-specific (task_type
/// determines which provider capability to re-invoke), so this loop
/// only logs what's due; wiring a dispatch table is left to the
/// deployment that knows its task-type set.
fn spawn_retry_sweep<S: TaskStore + 'static>(tasks: Arc<AsyncTaskEngine<S>>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let due = tasks.sweep_retries().await;
                    if !due.is_empty() {
                        info!(count = due.len(), "tasks due for retry");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

/// Spawns every periodic background loop; each owns its own
/// `tokio::spawn` handle and exits when `cancel` fires.
fn run_background_loops(
    cache_monitor: Arc<CacheMonitor>,
    alert_engine: Arc<AudioAlertEngine>,
    tracing_service: Arc<TracingService>,
    realtime: Arc<RealtimeSessionStore>,
    config: &GatewayConfig,
    cancel: CancellationToken,
) {
    {
        let interval = std::time::Duration::from_secs(config.alerting.evaluation_interval_secs.max(1));
        let cancel = cancel.clone();
        tokio::spawn(async move { cache_monitor.run_loop(interval, cancel).await });
    }

    {
        // No in-process producer feeds audio metric snapshots yet
        // (that belongs to the realtime session layer's own metrics
        // emission, out of this worker's scope); the channel just
        // keeps the loop ready for one to be wired in later.
        let (_tx, rx) = tokio::sync::mpsc::channel(64);
        let cancel = cancel.clone();
        tokio::spawn(async move { alert_engine.run_loop(rx, cancel).await });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move { tracing_service.run_cleanup_loop(cancel).await });
    }

    {
        let settings = config.realtime.clone();
        tokio::spawn(async move {
            realtime
                .run_lifecycle_loop(
                    std::time::Duration::from_secs(settings.cleanup_interval_secs.max(1)),
                    std::time::Duration::from_secs(settings.max_session_age_secs),
                    std::time::Duration::from_secs(settings.zombie_session_threshold_secs),
                    settings.auto_terminate_zombies,
                    cancel,
                )
                .await
        });
    }

    info!("background loops started");
}
