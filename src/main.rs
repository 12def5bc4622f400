//! Doorkeeper - access-control reconciliation server
//!
//! Main entry point: loads the stores, connects the device links, starts
//! the reconciler and serves the API.

use doorkeeper::{
    auth::AllowAll,
    catalog::Namespace,
    device_gateway::{Fleet, MemoryGateway},
    reconciler::Reconciler,
    rules::{NoRules, Rules, StaticRules},
    state::{AppConfig, AppState},
    system::{persistence, System},
    task_queue::TaskQueue,
    web_api,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often dirty state is flushed to disk
const SAVE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doorkeeper=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Doorkeeper v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        mode = %config.run_mode,
        interval_secs = config.reconcile_interval_secs,
        "Configuration loaded"
    );

    // Stores
    let system = Arc::new(System::load(&config.data_dir, config.compaction()).await?);

    // Device links
    let fleet = Arc::new(Fleet::new(config.device_lock_timeout_ms));
    match &config.fleet_file {
        Some(path) => {
            let gateway = Arc::new(MemoryGateway::load(path).await?);
            let view = system.view().await;
            let link = view
                .state
                .interfaces
                .list()
                .next()
                .map(|i| i.oid.clone())
                .unwrap_or_else(|| Namespace::Interfaces.instance(1));
            fleet.add_link(link, gateway).await;
        }
        None => tracing::warn!("No device links configured, controllers will report unreachable"),
    }

    // Rules
    let rules: Arc<dyn Rules> = match &config.rules_file {
        Some(path) => Arc::new(StaticRules::load(path).await?),
        None => Arc::new(NoRules),
    };

    // TaskQ + reconciler
    let (queue, _worker) = TaskQueue::new(config.task_queue_capacity);
    let reconciler = Arc::new(Reconciler::new(
        system.clone(),
        fleet.clone(),
        rules,
        queue,
        config.reconciler(),
    ));
    reconciler.start().await;

    // Persistence
    let _saver = persistence::spawn_saver(system.clone(), config.data_dir.clone(), SAVE_INTERVAL);

    let state = AppState {
        config: config.clone(),
        system: system.clone(),
        fleet,
        reconciler: reconciler.clone(),
        auth: Arc::new(AllowAll::new("api")),
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler.stop().await;
    system.save(&config.data_dir).await?;
    tracing::info!("State saved, bye");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
