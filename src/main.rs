//! Coinboard service entry point
//!
//! Wires the price store, the three source adapters and the dashboard API.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use coinboard::config::{resolve_env, AppConfig};
use coinboard::dashboard::{create_router, AppState, WebSocketBroadcaster};
use coinboard::oracle::signing::CoinbaseCredentials;
use coinboard::oracle::sources::{
    build_http_client, spawn_event_logger, BinanceClient, CoinbaseClient, CoinrankingClient,
    EventSink, SourceAdapter,
};
use coinboard::oracle::PriceStore;
use coinboard::telemetry::init_logging;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config.logging)?;

    info!("Starting coinboard v{}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config);

    let http = build_http_client(Duration::from_secs(config.http.timeout_secs))?;
    let store = Arc::new(PriceStore::new());

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let _event_logger = spawn_event_logger(event_rx);
    let events = EventSink::new(event_tx);

    let binance = Arc::new(BinanceClient::new(
        config.binance.clone(),
        http.clone(),
        store.clone(),
        events.clone(),
    ));
    let coinbase = Arc::new(CoinbaseClient::new(
        config.coinbase.clone(),
        http.clone(),
        CoinbaseCredentials::from_env(),
        store.clone(),
        events.clone(),
    ));
    let coinranking = Arc::new(CoinrankingClient::new(
        config.coinranking.clone(),
        http,
        resolve_env(&["RAPID_API_KEY"]),
        store.clone(),
        events,
    ));

    // Attach before any adapter writes so the first merge reaches /ws
    let broadcaster = WebSocketBroadcaster::new(config.server.broadcast_capacity);
    broadcaster.attach(&store);

    let mut tasks = Vec::new();
    if config.coinranking.enabled {
        tasks.extend(coinranking.clone().spawn());
    }
    if config.binance.enabled {
        tasks.extend(binance.clone().spawn());
    }
    if config.coinbase.enabled {
        tasks.extend(coinbase.clone().spawn());
    }
    info!(tasks = tasks.len(), "Source adapters started");

    let app = create_router(AppState {
        store,
        binance,
        coinbase,
        coinranking,
        broadcaster,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Dashboard API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Dashboard server failed")?;

    for task in tasks {
        task.abort();
    }
    info!("Coinboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
