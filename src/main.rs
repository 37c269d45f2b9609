use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};

use pricevault::adjust::{AdjustmentDetector, AdjustmentFixer};
use pricevault::config::Config;
use pricevault::coverage::CoverageService;
use pricevault::db::Db;
use pricevault::jobs::FetchWorker;
use pricevault::locks::SymbolLocks;
use pricevault::maintenance::MaintenanceService;
use pricevault::provider::yahoo::YahooProvider;
use pricevault::store::events::EventStore;
use pricevault::store::jobs::JobStore;
use pricevault::store::prices::PriceStore;
use pricevault::store::symbols::SymbolStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    let db = Db::open(&config.database_path)?;
    tracing::info!(path = %config.database_path, "database ready");

    let prices = PriceStore::new(db.clone());
    let symbols = SymbolStore::new(db.clone());
    let events = EventStore::new(db.clone());
    let jobs = JobStore::new(db, &config);

    let provider = Arc::new(YahooProvider::new(&config)?);
    let locks = Arc::new(SymbolLocks::new());
    let coverage = Arc::new(CoverageService::new(
        prices.clone(),
        symbols.clone(),
        events.clone(),
        provider.clone(),
        locks.clone(),
        config.refetch_days,
    ));

    let detector = Arc::new(AdjustmentDetector::new(
        prices.clone(),
        symbols.clone(),
        events.clone(),
        provider,
        &config,
    ));
    let fixer = Arc::new(AdjustmentFixer::new(
        prices,
        symbols.clone(),
        events.clone(),
        jobs.clone(),
        locks,
    ));
    let maintenance = MaintenanceService::new(
        symbols.clone(),
        jobs.clone(),
        events,
        detector,
        fixer,
        &config,
    );

    // pick up whatever a previous process left behind
    let reconciled = maintenance.reconcile().await?;
    if !reconciled.abandoned_jobs.is_empty() {
        tracing::warn!(
            jobs = ?reconciled.abandoned_jobs,
            "previous run left jobs mid-flight"
        );
    }

    let cancel = CancellationToken::new();
    let worker = Arc::new(FetchWorker::new(
        jobs,
        coverage,
        symbols,
        &config,
        std::time::Duration::from_secs(1),
        cancel.clone(),
    ));
    let worker_handle = worker.spawn();

    let app = axum::Router::new()
        .route("/health", axum::routing::get(|| async { "ok" }))
        .layer(tower_http::cors::CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("pricevault listening on {addr}");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = worker_handle.await;
    tracing::info!("shutdown complete");
    Ok(())
}
