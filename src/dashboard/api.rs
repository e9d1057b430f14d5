//! Dashboard HTTP API
//!
//! REST endpoints for the dashboard frontend.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::types::*;
use super::{ApiError, AppState};
use crate::oracle::sources::{is_valid_interval, is_valid_product_id, SourceAdapter};
use crate::types::now_millis;

const DEFAULT_KLINE_INTERVAL: &str = "1h";
const DEFAULT_KLINE_LIMIT: u32 = 100;
const MAX_KLINE_LIMIT: u32 = 1000;
const DEFAULT_CANDLE_GRANULARITY: u32 = 3600;
const VALID_GRANULARITIES: [u32; 6] = [60, 300, 900, 3600, 21_600, 86_400];
const DEFAULT_COINS_LIMIT: usize = 50;
const MAX_COINS_LIMIT: usize = 100;
const MAX_BATCH_IDS: usize = 100;
const DEFAULT_HISTORY_PERIOD: &str = "24h";

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        // Merged table
        .route("/api/prices", get(get_prices))
        // Binance
        .route("/api/binance/prices", get(get_binance_prices))
        .route("/api/binance/health", get(get_binance_health))
        .route("/api/binance/klines", get(get_binance_klines))
        // Coinbase
        .route("/api/coinbase/prices", get(get_coinbase_prices))
        .route("/api/coinbase/health", get(get_coinbase_health))
        .route("/api/coinbase/candles", get(get_coinbase_candles))
        // Coinranking
        .route("/api/coinranking/coins", get(get_coinranking_coins))
        .route("/api/coinranking/coin/:id", get(get_coinranking_coin))
        .route(
            "/api/coinranking/coin/:id/history",
            get(get_coinranking_history),
        )
        .route("/api/coinranking/batch/coins", post(post_coinranking_batch))
        .route("/api/coinranking/stats", get(get_coinranking_stats))
        .route("/api/coinranking/cache", delete(delete_coinranking_cache))
        // WebSocket
        .route("/ws", get(websocket_handler))
        // State
        .with_state(state)
        // CORS for frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// ─────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────

/// GET /api/health
async fn get_health() -> impl IntoResponse {
    Json(ServiceHealthResponse {
        success: true,
        status: "online",
        timestamp: now_millis(),
    })
}

/// GET /api/prices - Merged table with per-tier stats
async fn get_prices(State(state): State<AppState>) -> impl IntoResponse {
    let data = state.store.get_all_prices();
    Json(PricesResponse {
        success: true,
        count: data.len(),
        data,
        stats: Some(state.store.get_stats()),
        timestamp: now_millis(),
    })
}

async fn local_table<A: SourceAdapter + ?Sized>(adapter: &A) -> PricesResponse {
    let data = adapter.local_prices().await;
    PricesResponse {
        success: true,
        count: data.len(),
        data,
        stats: None,
        timestamp: now_millis(),
    }
}

async fn adapter_health<A: SourceAdapter + ?Sized>(adapter: &A) -> ExchangeHealthResponse {
    ExchangeHealthResponse {
        success: true,
        exchange: adapter.name().to_lowercase(),
        status: "online",
        tokens_tracked: adapter.tokens_tracked().await,
        timestamp: now_millis(),
    }
}

/// GET /api/binance/prices
async fn get_binance_prices(State(state): State<AppState>) -> impl IntoResponse {
    Json(local_table(state.binance.as_ref()).await)
}

/// GET /api/binance/health
async fn get_binance_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(adapter_health(state.binance.as_ref()).await)
}

/// GET /api/binance/klines?symbol=BTCUSDT&interval=1h&limit=100
async fn get_binance_klines(
    Query(query): Query<KlinesQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let symbol = query
        .symbol
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("symbol is required".to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_KLINE_LIMIT);
    if !(1..=MAX_KLINE_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_KLINE_LIMIT
        )));
    }
    let interval = query
        .interval
        .unwrap_or_else(|| DEFAULT_KLINE_INTERVAL.to_string());
    if !is_valid_interval(&interval) {
        return Err(ApiError::BadRequest(format!(
            "unsupported interval: {}",
            interval
        )));
    }

    let klines = state.binance.klines(&symbol, &interval, limit).await?;
    Ok(Json(ApiResponse::success(klines)))
}

/// GET /api/coinbase/prices
async fn get_coinbase_prices(State(state): State<AppState>) -> impl IntoResponse {
    Json(local_table(state.coinbase.as_ref()).await)
}

/// GET /api/coinbase/health
async fn get_coinbase_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(adapter_health(state.coinbase.as_ref()).await)
}

/// GET /api/coinbase/candles?product_id=BTC-USD&granularity=3600
async fn get_coinbase_candles(
    Query(query): Query<CandlesQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let product_id = query
        .product_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("product_id is required".to_string()))?;
    let granularity = query.granularity.unwrap_or(DEFAULT_CANDLE_GRANULARITY);
    if !VALID_GRANULARITIES.contains(&granularity) {
        return Err(ApiError::BadRequest(format!(
            "granularity must be one of {:?}",
            VALID_GRANULARITIES
        )));
    }

    let product_id = product_id.trim().to_uppercase();
    if !is_valid_product_id(&product_id) {
        return Err(ApiError::BadRequest(
            "product_id must look like BASE-QUOTE".to_string(),
        ));
    }

    let candles = state.coinbase.candles(&product_id, granularity).await?;
    Ok(Json(ApiResponse::success(candles)))
}

fn coinranking_response(state: &AppState, data: serde_json::Value) -> Json<CoinrankingResponse> {
    Json(CoinrankingResponse {
        success: true,
        data,
        metadata: state.coinranking.metadata(),
    })
}

/// GET /api/coinranking/coins?limit=50&offset=0
async fn get_coinranking_coins(
    Query(query): Query<CoinsQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_COINS_LIMIT);
    if !(1..=MAX_COINS_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_COINS_LIMIT
        )));
    }
    let data = state
        .coinranking
        .get_coins(limit, query.offset.unwrap_or(0))
        .await?;
    Ok(coinranking_response(&state, data))
}

/// GET /api/coinranking/coin/:id
async fn get_coinranking_coin(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let data = state.coinranking.get_coin(&id).await?;
    Ok(coinranking_response(&state, data))
}

/// GET /api/coinranking/coin/:id/history?timePeriod=24h
async fn get_coinranking_history(
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let period = query
        .time_period
        .unwrap_or_else(|| DEFAULT_HISTORY_PERIOD.to_string());
    let data = state.coinranking.get_coin_history(&id, &period).await?;
    Ok(coinranking_response(&state, data))
}

/// POST /api/coinranking/batch/coins {"ids": [...]}
async fn post_coinranking_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchCoinsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.ids.is_empty() || body.ids.len() > MAX_BATCH_IDS {
        return Err(ApiError::BadRequest(format!(
            "ids must contain between 1 and {} entries",
            MAX_BATCH_IDS
        )));
    }
    let results = state.coinranking.batch_coins(&body.ids).await;
    Ok(coinranking_response(&state, json!(results)))
}

/// GET /api/coinranking/stats
async fn get_coinranking_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let data = state.coinranking.get_stats().await?;
    Ok(coinranking_response(&state, data))
}

/// DELETE /api/coinranking/cache
async fn delete_coinranking_cache(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.coinranking.clear_cache();
    tracing::info!(cleared, "Coinranking cache cleared");
    coinranking_response(&state, json!({ "cleared": cleared }))
}

// ─────────────────────────────────────────────────────────────────
// WebSocket Handler
// ─────────────────────────────────────────────────────────────────

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};

/// WebSocket upgrade handler
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Outgoing message type for WebSocket
enum OutgoingMessage {
    Text(String),
    Pong(Vec<u8>),
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::broadcast::error::RecvError;

    tracing::info!("New dashboard WebSocket connection");

    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so no update falls in between
    let mut rx = state.broadcaster.subscribe();

    let snapshot = WsMessage::Snapshot(state.store.get_all_prices());
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    // Channel for outgoing messages
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<OutgoingMessage>(32);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let result = match msg {
                OutgoingMessage::Text(text) => sender.send(Message::Text(text)).await,
                OutgoingMessage::Pong(data) => sender.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            broadcast_msg = rx.recv() => {
                match broadcast_msg {
                    Ok(msg) => {
                        if out_tx.send(OutgoingMessage::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    // Slow client: skip to the newest table
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket client lagging");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if out_tx.send(OutgoingMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received WebSocket message: {}", text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    send_task.abort();
    tracing::info!("Dashboard WebSocket connection closed");
}
