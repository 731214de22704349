mod api;
mod config;
mod error;
mod pipeline;
mod types;

use api::fastforex::rest::FastForexClient;
use api::server::{self, AppState};
use config::Config;
use env_logger::Builder;
use log::{info, LevelFilter};
use pipeline::alerts::ThresholdEvaluator;
use pipeline::broadcast::Broadcaster;
use pipeline::cache::LatestStateCache;
use pipeline::fetcher::RateFetcher;
use pipeline::ledger::Ledger;
use pipeline::notifier::Notifier;
use pipeline::scheduler::{Pipeline, Scheduler};
use pipeline::store::{DocumentStore, JsonFileStore, MemoryStore};
use std::error::Error;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

fn init_logger() {
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .filter_module("ratewatch", LevelFilter::Debug)
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("tungstenite", LevelFilter::Warn)
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%H:%M:%S%.3f");
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                ts,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr);
    // RUST_LOG, when set, overrides the defaults above.
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    init_logger();
    info!("Starting ratewatch...");

    let config = Config::load()?;

    let store: Arc<dyn DocumentStore> = match &config.ledger_path {
        Some(path) => Arc::new(JsonFileStore::new(path.clone())),
        None => Arc::new(MemoryStore::new()),
    };
    let ledger = Arc::new(Ledger::new(store));

    let cache = Arc::new(LatestStateCache::new());
    let broadcaster = Arc::new(Broadcaster::new(cache, config.heartbeat));
    let notifier = Arc::new(Notifier::from_config(config.mail.as_ref())?);
    let provider = Arc::new(FastForexClient::new(
        config.api_url.clone(),
        config.api_key.clone(),
    )?);
    let thresholds = Arc::new(config.thresholds.clone());

    let pipeline = Arc::new(Pipeline::new(
        RateFetcher::new(provider),
        ThresholdEvaluator::new(notifier, broadcaster.clone()),
        ledger.clone(),
        broadcaster.clone(),
        thresholds,
    ));
    let scheduler = Arc::new(Scheduler::new(pipeline, config.schedule_at));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Scheduler: one run now, then daily
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState {
        scheduler,
        ledger,
        broadcaster: broadcaster.clone(),
    };
    let http_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(http_addr, state).await {
            log::error!("HTTP server failed: {}", e);
        }
    });

    let ws_listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.ws_port))).await?;
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = api::ws::serve(ws_listener, broadcaster).await {
            log::error!("WebSocket listener failed: {}", e);
        }
    });

    // Run until a listener dies or we are interrupted
    tokio::select! {
        _ = http_handle => {},
        _ = ws_handle => {},
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    };

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    info!("Shutdown complete");
    Ok(())
}
