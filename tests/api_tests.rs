//! Dashboard API tests (no outbound network)

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    use coinboard::config::AppConfig;
    use coinboard::dashboard::{create_router, AppState, WebSocketBroadcaster};
    use coinboard::oracle::sources::{
        build_http_client, BinanceClient, CoinbaseClient, CoinrankingClient, EventSink,
    };
    use coinboard::oracle::PriceStore;
    use coinboard::types::PriceUpdate;

    fn app(store: Arc<PriceStore>) -> Router {
        let config = AppConfig::defaults().unwrap();
        let http = build_http_client(Duration::from_secs(1)).unwrap();

        let binance = Arc::new(BinanceClient::new(
            config.binance,
            http.clone(),
            store.clone(),
            EventSink::disabled(),
        ));
        let coinbase = Arc::new(CoinbaseClient::new(
            config.coinbase,
            http.clone(),
            None,
            store.clone(),
            EventSink::disabled(),
        ));
        let coinranking = Arc::new(CoinrankingClient::new(
            config.coinranking,
            http,
            None,
            store.clone(),
            EventSink::disabled(),
        ));

        create_router(AppState {
            store,
            binance,
            coinbase,
            coinranking,
            broadcaster: WebSocketBroadcaster::new(8),
        })
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        send(app, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    // ============================================================================
    // Merged table
    // ============================================================================

    #[tokio::test]
    async fn test_prices_returns_sorted_table_with_stats() {
        let store = Arc::new(PriceStore::new());
        store.update_from_coinranking(&[PriceUpdate::new("SOL", 100.0), PriceUpdate::new("ADA", 0.5)]);
        store.update_from_binance(&[PriceUpdate::new("BTC", 50_000.0)]);

        let (status, body) = get(app(store), "/api/prices").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["count"], 3);
        assert_eq!(body["data"][0]["symbol"], "ADA");
        assert_eq!(body["data"][1]["symbol"], "BTC");
        assert_eq!(body["data"][1]["source"], "binance");
        assert_eq!(body["stats"]["total"], 3);
        assert_eq!(body["stats"]["coinranking"], 2);
        assert_eq!(body["stats"]["binance"], 1);
        assert_eq!(body["stats"]["coinbase"], 0);
        assert!(body["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(app(Arc::new(PriceStore::new())), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");
    }

    // ============================================================================
    // Exchange tables
    // ============================================================================

    #[tokio::test]
    async fn test_exchange_tables_start_empty() {
        let store = Arc::new(PriceStore::new());
        store.update_from_binance(&[PriceUpdate::new("BTC", 50_000.0)]);

        let (status, body) = get(app(store.clone()), "/api/binance/prices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
        assert!(body.get("stats").is_none());

        let (_, body) = get(app(store), "/api/coinbase/prices").await;
        assert_eq!(body["data"], Value::Array(vec![]));
    }

    #[tokio::test]
    async fn test_exchange_health() {
        let store = Arc::new(PriceStore::new());

        let (status, body) = get(app(store.clone()), "/api/binance/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exchange"], "binance");
        assert_eq!(body["tokensTracked"], 0);

        let (_, body) = get(app(store), "/api/coinbase/health").await;
        assert_eq!(body["exchange"], "coinbase");
    }

    #[tokio::test]
    async fn test_klines_requires_symbol() {
        let (status, body) = get(app(Arc::new(PriceStore::new())), "/api/binance/klines").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("symbol"));
    }

    #[tokio::test]
    async fn test_candles_rejects_unknown_granularity() {
        let (status, body) = get(
            app(Arc::new(PriceStore::new())),
            "/api/coinbase/candles?product_id=BTC-USD&granularity=7",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_klines_rejects_interval_outside_whitelist() {
        let (status, body) = get(
            app(Arc::new(PriceStore::new())),
            "/api/binance/klines?symbol=BTC&interval=1h%26symbol%3DETHUSDT",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("interval"));
    }

    #[tokio::test]
    async fn test_candles_rejects_malformed_product_id() {
        let (status, body) = get(
            app(Arc::new(PriceStore::new())),
            "/api/coinbase/candles?product_id=BTC-USD%2F..%2Fstats&granularity=60",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("product_id"));
    }

    // ============================================================================
    // Coinranking
    // ============================================================================

    #[tokio::test]
    async fn test_coinranking_without_key_is_server_error() {
        let (status, body) = get(
            app(Arc::new(PriceStore::new())),
            "/api/coinranking/coins?limit=10",
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("RAPID_API_KEY"));
    }

    #[tokio::test]
    async fn test_coinranking_limit_bounds() {
        let (status, _) = get(
            app(Arc::new(PriceStore::new())),
            "/api/coinranking/coins?limit=0",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_coin_route_rejects_malformed_id() {
        let store = Arc::new(PriceStore::new());

        let (status, body) = get(app(store.clone()), "/api/coinranking/coin/abc%3Fx%3D1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = get(app(store), "/api/coinranking/coin/abc%3Fx%3D1/history").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_requires_ids() {
        let request = Request::post("/api/coinranking/batch/coins")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"ids": []}"#))
            .unwrap();
        let (status, body) = send(app(Arc::new(PriceStore::new())), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_clear_cache_reports_metadata() {
        let request = Request::delete("/api/coinranking/cache")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(Arc::new(PriceStore::new())), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["cleared"], 0);
        assert_eq!(body["metadata"]["cache"]["size"], 0);
        assert_eq!(body["metadata"]["rateLimiter"]["limit"], 50);
        assert_eq!(body["metadata"]["rateLimiter"]["requestsThisMinute"], 0);
    }
}
