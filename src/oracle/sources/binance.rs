//! Binance spot adapter
//!
//! Bootstraps every USDT pair from the REST ticker list, keeps a live ticker
//! stream open for the top N symbols (one socket per symbol), and re-polls
//! REST periodically for symbols that are not being streamed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};

use crate::config::BinanceConfig;
use crate::oracle::rate_limit::{FixedIntervalLimiter, RateLimiter};
use crate::oracle::sources::{
    should_reconnect_due_to_silence, watchdog_period, EventSink, SourceAdapter, SourceEvent,
};
use crate::oracle::store::{sorted_records, PriceStore};
use crate::types::{canonical_symbol, now_millis, PriceRecord, PriceSource, PriceUpdate};

const SOURCE: &str = "Binance";
const QUOTE_SUFFIX: &str = "USDT";

#[derive(Debug, Clone, Deserialize)]
struct RestTicker {
    symbol: String,
    price: String,
}

/// One candle as served by `/api/binance/klines`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trades: u64,
}

/// Binance adapter: REST bootstrap + per-symbol ticker streams
pub struct BinanceClient {
    config: BinanceConfig,
    http: reqwest::Client,
    limiter: FixedIntervalLimiter,
    store: Arc<PriceStore>,
    events: EventSink,
    prices: RwLock<HashMap<String, PriceRecord>>,
    /// Bootstrap order, used to pick the streamed symbols
    discovered: RwLock<Vec<String>>,
    /// One stream task per symbol
    streams: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BinanceClient {
    pub fn new(
        config: BinanceConfig,
        http: reqwest::Client,
        store: Arc<PriceStore>,
        events: EventSink,
    ) -> Self {
        let limiter =
            FixedIntervalLimiter::new(Duration::from_millis(config.min_request_interval_ms));
        Self {
            config,
            http,
            limiter,
            store,
            events,
            prices: RwLock::new(HashMap::new()),
            discovered: RwLock::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        self.limiter.wait_if_needed().await;

        let url = format!("{}{}", self.config.rest_url.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {} from Binance", path))?;

        if !response.status().is_success() {
            bail!("Binance API returned error: {}", response.status());
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Binance {} response", path))
    }

    /// Full REST ticker list reduced to USDT-quoted pairs
    async fn fetch_usdt_prices(&self) -> Result<Vec<PriceUpdate>> {
        let tickers: Vec<RestTicker> = self.get_json("/api/v3/ticker/price", &[]).await?;
        Ok(usdt_updates(tickers))
    }

    async fn write_local(&self, updates: &[PriceUpdate], source: PriceSource) {
        let now = now_millis();
        let mut prices = self.prices.write().await;
        for update in updates {
            let symbol = canonical_symbol(&update.symbol);
            prices.insert(symbol.clone(), update.clone().into_record(symbol, source, now));
        }
    }

    /// Handle one stream frame; returns how many prices it carried
    pub async fn handle_stream_message(&self, text: &str) -> Result<usize> {
        let updates = parse_ticker_message(text)?;
        if updates.is_empty() {
            return Ok(0);
        }

        self.write_local(&updates, PriceSource::BinanceWs).await;
        // The store does not distinguish live ticks from bootstrap data
        self.store.update_from_binance(&updates);
        Ok(updates.len())
    }

    fn stream_url(&self, symbol: &str) -> String {
        format!(
            "{}/{}{}@ticker",
            self.config.ws_url.trim_end_matches('/'),
            symbol.to_lowercase(),
            QUOTE_SUFFIX.to_lowercase()
        )
    }

    /// First `top_n` bootstrapped symbols
    pub async fn top_symbols(&self) -> Vec<String> {
        self.discovered
            .read()
            .await
            .iter()
            .take(self.config.top_n)
            .cloned()
            .collect()
    }

    /// Open streams for the top symbols not already streaming
    pub async fn start_streams(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for symbol in self.top_symbols().await {
            if self.start_stream(&symbol) {
                started += 1;
            }
        }
        tracing::info!(source = %SOURCE, started, "Ticker streams started");
        started
    }

    /// Spawn the stream task for `symbol` unless one is already running
    /// or the pool is full
    pub fn start_stream(self: &Arc<Self>, symbol: &str) -> bool {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.retain(|_, handle| !handle.is_finished());

        if streams.contains_key(symbol) || streams.len() >= self.config.top_n {
            return false;
        }

        let client = Arc::clone(self);
        let owned = symbol.to_string();
        let handle = tokio::spawn(async move { client.run_stream(owned).await });
        streams.insert(symbol.to_string(), handle);
        true
    }

    pub fn active_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Connection actor for one symbol; reconnects forever after a fixed delay
    async fn run_stream(self: Arc<Self>, symbol: String) {
        let url = self.stream_url(&symbol);
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);

        loop {
            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    self.events.emit(SourceEvent::Connected {
                        source: SOURCE,
                        stream: symbol.clone(),
                    });
                    self.read_stream(ws_stream, &symbol).await;
                    self.events.emit(SourceEvent::Disconnected {
                        source: SOURCE,
                        stream: symbol.clone(),
                    });
                }
                Err(e) => {
                    self.events.error(SOURCE, format!("connect {}", symbol), e);
                }
            }

            self.events.emit(SourceEvent::Reconnecting {
                source: SOURCE,
                stream: symbol.clone(),
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// Message loop with an inactivity watchdog; returns when the socket
    /// closes, errors, or stays silent past `stale_after_ms`
    async fn read_stream<S>(&self, ws_stream: WebSocketStream<S>, symbol: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let silence = Duration::from_millis(self.config.stale_after_ms);
        let (mut write, mut read) = ws_stream.split();

        let mut watchdog = tokio::time::interval(watchdog_period(silence));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                _ = watchdog.tick() => {
                    if should_reconnect_due_to_silence(last_message, silence) {
                        self.events.error(
                            SOURCE,
                            format!("stream {}", symbol),
                            format!("no data for {}ms, forcing reconnect", silence.as_millis()),
                        );
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            if let Err(e) = self.handle_stream_message(&text).await {
                                self.events.error(SOURCE, format!("parse {}", symbol), e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.events.error(SOURCE, format!("stream {}", symbol), e);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Fetch candles for `symbol`; a bare base asset gets the USDT suffix
    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        if !is_valid_interval(interval) {
            bail!("Unsupported kline interval: {}", interval);
        }
        let mut pair = canonical_symbol(symbol);
        if pair.is_empty() {
            bail!("Invalid symbol: {}", symbol);
        }
        if !pair.ends_with(QUOTE_SUFFIX) {
            pair.push_str(QUOTE_SUFFIX);
        }

        let rows: Vec<Vec<serde_json::Value>> = self
            .get_json(
                "/api/v3/klines",
                &[
                    ("symbol", pair),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        Ok(rows.iter().filter_map(|row| parse_kline_row(row)).collect())
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.refresh_interval_secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            interval.tick().await;

            // A failed bootstrap leaves nothing to refresh; retry discovery instead
            let result = if self.prices.read().await.is_empty() {
                match self.bootstrap().await {
                    Ok(n) => {
                        self.start_streams().await;
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.refresh().await
            };

            match result {
                Ok(updated) => tracing::debug!(source = %SOURCE, updated, "Periodic refresh done"),
                Err(e) => self.events.error(SOURCE, "refresh", e),
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for BinanceClient {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn bootstrap(&self) -> Result<usize> {
        let updates = self.fetch_usdt_prices().await?;

        self.write_local(&updates, PriceSource::Binance).await;
        {
            let mut discovered = self.discovered.write().await;
            for update in &updates {
                if !discovered.contains(&update.symbol) {
                    discovered.push(update.symbol.clone());
                }
            }
        }
        self.store.update_from_binance(&updates);

        tracing::info!(source = %SOURCE, count = updates.len(), "Bootstrapped USDT tickers");
        Ok(updates.len())
    }

    async fn refresh(&self) -> Result<usize> {
        let fresh = self.fetch_usdt_prices().await?;
        let updates = refresh_candidates(&*self.prices.read().await, fresh);

        self.write_local(&updates, PriceSource::BinanceRefresh).await;
        self.store.merge(PriceSource::BinanceRefresh, &updates);
        Ok(updates.len())
    }

    async fn local_prices(&self) -> Vec<PriceRecord> {
        sorted_records(&*self.prices.read().await)
    }

    async fn tokens_tracked(&self) -> usize {
        self.prices.read().await.len()
    }

    fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let client = self;
        let handle = tokio::spawn(async move {
            match client.bootstrap().await {
                Ok(_) => {
                    client.start_streams().await;
                }
                Err(e) => client.events.error(SOURCE, "bootstrap", e),
            }
            client.run_refresh_loop().await;
        });
        vec![handle]
    }
}

/// Intervals accepted by `/api/v3/klines`
pub const KLINE_INTERVALS: [&str; 16] = [
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

pub fn is_valid_interval(interval: &str) -> bool {
    KLINE_INTERVALS.contains(&interval)
}

/// Refresh only symbols already tracked and not kept live by a stream
fn refresh_candidates(
    local: &HashMap<String, PriceRecord>,
    fresh: Vec<PriceUpdate>,
) -> Vec<PriceUpdate> {
    fresh
        .into_iter()
        .filter(|update| {
            local
                .get(&update.symbol)
                .map_or(false, |existing| existing.source != PriceSource::BinanceWs)
        })
        .collect()
}

/// Keep USDT pairs and split them into base asset + price
fn usdt_updates(tickers: Vec<RestTicker>) -> Vec<PriceUpdate> {
    tickers
        .into_iter()
        .filter_map(|ticker| {
            let base = ticker.symbol.strip_suffix(QUOTE_SUFFIX)?;
            let symbol = canonical_symbol(base);
            if symbol.is_empty() {
                return None;
            }
            let price = ticker.price.parse::<f64>().ok()?;
            Some(PriceUpdate::new(symbol, price).with_pair(ticker.symbol))
        })
        .collect()
}

/// Normalize a ticker stream frame (single object or array of tickers)
pub fn parse_ticker_message(text: &str) -> Result<Vec<PriceUpdate>> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("Invalid Binance stream frame")?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        // Combined-stream envelope: {"stream": "...", "data": {...}}
        serde_json::Value::Object(mut obj) if obj.contains_key("data") => {
            vec![obj.remove("data").unwrap_or_default()]
        }
        other => vec![other],
    };

    Ok(items.iter().filter_map(parse_ticker_item).collect())
}

fn parse_ticker_item(item: &serde_json::Value) -> Option<PriceUpdate> {
    let pair = item["s"].as_str()?;
    let base = pair.strip_suffix(QUOTE_SUFFIX).unwrap_or(pair);
    let symbol = canonical_symbol(base);
    if symbol.is_empty() {
        return None;
    }
    let price = crate::types::parse_price(&item["c"])?;

    let mut update = PriceUpdate::new(symbol, price).with_pair(pair);
    if let Some(event_time) = item["E"].as_i64() {
        update = update.with_timestamp(event_time);
    }
    Some(update)
}

/// [open_time, open, high, low, close, volume, close_time, quote_volume, trades, ...]
fn parse_kline_row(row: &[serde_json::Value]) -> Option<Kline> {
    if row.len() < 9 {
        return None;
    }
    let num = |v: &serde_json::Value| crate::types::parse_price(v);

    Some(Kline {
        timestamp: row[0].as_i64()?,
        open: num(&row[1])?,
        high: num(&row[2])?,
        low: num(&row[3])?,
        close: num(&row[4])?,
        volume: num(&row[5])?,
        close_time: row[6].as_i64()?,
        quote_volume: num(&row[7])?,
        trades: row[8].as_u64()?,
    })
}
