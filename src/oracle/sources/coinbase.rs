//! Coinbase Exchange adapter
//!
//! Bootstraps every online USD product through signed REST calls in small
//! batches, then follows a single `ticker` WebSocket subscription covering
//! all of them. Products not updated by the stream are re-polled on a timer.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::CoinbaseConfig;
use crate::oracle::rate_limit::{FixedIntervalLimiter, RateLimiter};
use crate::oracle::signing::CoinbaseCredentials;
use crate::oracle::sources::{
    should_reconnect_due_to_silence, watchdog_period, EventSink, SourceAdapter, SourceEvent,
};
use crate::oracle::store::{sorted_records, PriceStore};
use crate::types::{canonical_symbol, now_millis, PriceRecord, PriceSource, PriceUpdate, SourceTier};

const SOURCE: &str = "Coinbase";

#[derive(Debug, Clone, Deserialize)]
struct Product {
    id: String,
    base_currency: String,
    quote_currency: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    trading_disabled: bool,
}

impl Product {
    fn is_tradable_usd(&self) -> bool {
        self.quote_currency.eq_ignore_ascii_case("USD")
            && !self.trading_disabled
            && self.status.eq_ignore_ascii_case("online")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RestTicker {
    price: String,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default, alias = "open")]
    open_24h: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SubscribeMsg {
    #[serde(rename = "type")]
    msg_type: &'static str,
    product_ids: Vec<String>,
    channels: Vec<&'static str>,
}

#[derive(Debug, Clone, Deserialize)]
struct WsTicker {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    open_24h: Option<String>,
    #[serde(default)]
    volume_24h: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

/// One candle as served by `/api/coinbase/candles`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub low: f64,
    pub high: f64,
    pub open: f64,
    pub close: f64,
    pub volume: f64,
}

/// 24h change in percent with two decimals; "0" when the open is unusable
pub fn compute_change_24h(price: &str, open_24h: &str) -> String {
    let price = price.trim().parse::<f64>().unwrap_or(f64::NAN);
    let open = open_24h.trim().parse::<f64>().unwrap_or(f64::NAN);

    if !open.is_finite() || !price.is_finite() || open == 0.0 {
        return "0".to_string();
    }
    format!("{:.2}", (price - open) / open * 100.0)
}

/// `BASE-QUOTE`, both parts ASCII alphanumeric
pub fn is_valid_product_id(product_id: &str) -> bool {
    let mut parts = product_id.split('-');
    let ok = |part: Option<&str>| {
        part.map_or(false, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
    };
    ok(parts.next()) && ok(parts.next()) && parts.next().is_none()
}

/// Product ids whose local record is not kept live by the ticker stream
fn refresh_products(local: &HashMap<String, PriceRecord>) -> Vec<String> {
    let mut ids: Vec<String> = local
        .values()
        .filter(|record| record.source != PriceSource::CoinbaseWs)
        .filter_map(|record| record.pair.clone())
        .collect();
    ids.sort();
    ids
}

fn base_of(product_id: &str) -> String {
    canonical_symbol(product_id.split('-').next().unwrap_or(product_id))
}

/// Coinbase adapter: batched REST bootstrap + one shared ticker stream
pub struct CoinbaseClient {
    config: CoinbaseConfig,
    http: reqwest::Client,
    limiter: FixedIntervalLimiter,
    credentials: Option<CoinbaseCredentials>,
    store: Arc<PriceStore>,
    events: EventSink,
    prices: RwLock<HashMap<String, PriceRecord>>,
    products: RwLock<Vec<String>>,
}

impl CoinbaseClient {
    pub fn new(
        config: CoinbaseConfig,
        http: reqwest::Client,
        credentials: Option<CoinbaseCredentials>,
        store: Arc<PriceStore>,
        events: EventSink,
    ) -> Self {
        if credentials.is_none() {
            tracing::warn!(source = %SOURCE, "COINBASE_API_KEY/SECRET not set, using unsigned requests");
        }
        let limiter =
            FixedIntervalLimiter::new(Duration::from_millis(config.min_request_interval_ms));
        Self {
            config,
            http,
            limiter,
            credentials,
            store,
            events,
            prices: RwLock::new(HashMap::new()),
            products: RwLock::new(Vec::new()),
        }
    }

    /// `request_path` includes any query string; it is what gets signed
    async fn get_json<T: serde::de::DeserializeOwned>(&self, request_path: &str) -> Result<T> {
        self.limiter.wait_if_needed().await;

        let url = format!("{}{}", self.config.rest_url.trim_end_matches('/'), request_path);
        let mut request = self.http.get(&url);
        if let Some(credentials) = &self.credentials {
            request = request.headers(credentials.headers("GET", request_path, "")?);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch {} from Coinbase", request_path))?;

        if !response.status().is_success() {
            bail!("Coinbase API returned error: {}", response.status());
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Coinbase {} response", request_path))
    }

    async fn fetch_usd_products(&self) -> Result<Vec<String>> {
        let products: Vec<Product> = self.get_json("/products").await?;
        Ok(products
            .into_iter()
            .filter(Product::is_tradable_usd)
            .map(|p| p.id)
            .collect())
    }

    /// Ticker for one product, enriched from any coinranking record
    async fn fetch_ticker(&self, product_id: &str) -> Result<PriceUpdate> {
        let ticker: RestTicker = self
            .get_json(&format!("/products/{}/ticker", product_id))
            .await?;
        let price = ticker
            .price
            .parse::<f64>()
            .with_context(|| format!("Invalid price for {}", product_id))?;

        let change = ticker
            .open_24h
            .as_deref()
            .map(|open| compute_change_24h(&ticker.price, open));

        let symbol = base_of(product_id);
        let mut update = PriceUpdate::new(symbol.clone(), price).with_pair(product_id);
        update.volume24h = ticker.volume;
        update.change24h = change;
        self.enrich_from_coinranking(&mut update);
        Ok(update)
    }

    fn enrich_from_coinranking(&self, update: &mut PriceUpdate) {
        let Some(existing) = self.store.get(&update.symbol) else {
            return;
        };
        if existing.source.tier() != SourceTier::Coinranking {
            return;
        }
        if update.market_cap.is_none() {
            update.market_cap = existing.market_cap;
        }
        if update.change24h.is_none() {
            update.change24h = existing.change24h;
        }
    }

    /// Fetch tickers in batches, pausing between batches; failures are skipped
    async fn fetch_in_batches(&self, product_ids: &[String], batch_size: usize) -> Vec<PriceUpdate> {
        let mut updates = Vec::with_capacity(product_ids.len());
        let delay = Duration::from_millis(self.config.batch_delay_ms);

        for (i, batch) in product_ids.chunks(batch_size.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }

            let results = join_all(batch.iter().map(|id| self.fetch_ticker(id))).await;
            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(update) => updates.push(update),
                    Err(e) => self.events.error(SOURCE, format!("ticker {}", id), e),
                }
            }
        }
        updates
    }

    async fn write_local(&self, updates: &[PriceUpdate], source: PriceSource) {
        let now = now_millis();
        let mut prices = self.prices.write().await;
        for update in updates {
            let symbol = canonical_symbol(&update.symbol);
            prices.insert(symbol.clone(), update.clone().into_record(symbol, source, now));
        }
    }

    /// Handle one stream frame; returns the update for ticker frames
    pub async fn handle_ws_message(&self, text: &str) -> Result<Option<PriceUpdate>> {
        let msg: WsTicker = serde_json::from_str(text).context("Invalid Coinbase stream frame")?;
        if msg.msg_type != "ticker" {
            return Ok(None);
        }
        let (Some(product_id), Some(price_str)) = (msg.product_id, msg.price) else {
            return Ok(None);
        };
        let price = price_str
            .parse::<f64>()
            .with_context(|| format!("Invalid ticker price for {}", product_id))?;

        let symbol = base_of(&product_id);
        let previous = self.prices.read().await.get(&symbol).cloned();

        let mut update = PriceUpdate::new(symbol, price).with_pair(product_id.as_str());
        update.change24h = match msg.open_24h.as_deref() {
            Some(open) => Some(compute_change_24h(&price_str, open)),
            None => previous.as_ref().and_then(|p| p.change24h.clone()),
        };
        update.volume24h = msg
            .volume_24h
            .or_else(|| previous.as_ref().and_then(|p| p.volume24h.clone()));
        update.market_cap = previous.and_then(|p| p.market_cap);
        if let Some(ts) = msg
            .time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        {
            update = update.with_timestamp(ts.timestamp_millis());
        }

        let batch = [update];
        self.write_local(&batch, PriceSource::CoinbaseWs).await;
        self.store.merge(PriceSource::CoinbaseWs, &batch);
        let [update] = batch;
        Ok(Some(update))
    }

    /// Single connection actor; reconnects forever after a fixed delay
    async fn run_stream(self: Arc<Self>) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let stream_name = "ticker".to_string();

        loop {
            let product_ids = self.products.read().await.clone();
            if product_ids.is_empty() {
                // Nothing bootstrapped yet
                tokio::time::sleep(delay).await;
                continue;
            }

            if let Err(e) = self.stream_once(&product_ids).await {
                self.events.error(SOURCE, "ticker stream", e);
            }
            self.events.emit(SourceEvent::Disconnected {
                source: SOURCE,
                stream: stream_name.clone(),
            });

            self.events.emit(SourceEvent::Reconnecting {
                source: SOURCE,
                stream: stream_name.clone(),
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_once(&self, product_ids: &[String]) -> Result<()> {
        let (ws_stream, _) = connect_async(self.config.ws_url.as_str())
            .await
            .context("Failed to connect to Coinbase WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let sub_msg = SubscribeMsg {
            msg_type: "subscribe",
            product_ids: product_ids.to_vec(),
            channels: vec!["ticker"],
        };
        write
            .send(Message::Text(serde_json::to_string(&sub_msg)?))
            .await
            .context("Failed to send Coinbase subscription")?;

        self.events.emit(SourceEvent::Connected {
            source: SOURCE,
            stream: format!("ticker ({} products)", product_ids.len()),
        });

        let silence = Duration::from_millis(self.config.stale_after_ms);
        let mut watchdog = tokio::time::interval(watchdog_period(silence));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                _ = watchdog.tick() => {
                    if should_reconnect_due_to_silence(last_message, silence) {
                        let _ = write.send(Message::Close(None)).await;
                        bail!("No data for {}ms, forcing reconnect", silence.as_millis());
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            if let Err(e) = self.handle_ws_message(&text).await {
                                self.events.error(SOURCE, "parse ticker", e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(anyhow::Error::new(e).context("Coinbase WebSocket error"))
                        }
                    }
                }
            }
        }
    }

    pub async fn candles(&self, product_id: &str, granularity: u32) -> Result<Vec<Candle>> {
        if !is_valid_product_id(product_id) {
            bail!("Invalid product id: {}", product_id);
        }
        let rows: Vec<Vec<f64>> = self
            .get_json(&format!(
                "/products/{}/candles?granularity={}",
                product_id, granularity
            ))
            .await?;
        Ok(rows.iter().filter_map(|row| parse_candle_row(row)).collect())
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.refresh_interval_secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            interval.tick().await;

            let result = if self.products.read().await.is_empty() {
                self.bootstrap().await
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
impl SourceAdapter for CoinbaseClient {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn bootstrap(&self) -> Result<usize> {
        let product_ids = self.fetch_usd_products().await?;
        tracing::info!(source = %SOURCE, products = product_ids.len(), "Fetching USD tickers");

        let updates = self
            .fetch_in_batches(&product_ids, self.config.batch_size)
            .await;

        self.write_local(&updates, PriceSource::Coinbase).await;
        self.store.update_from_coinbase(&updates);
        *self.products.write().await = product_ids;

        tracing::info!(source = %SOURCE, count = updates.len(), "Bootstrapped USD tickers");
        Ok(updates.len())
    }

    async fn refresh(&self) -> Result<usize> {
        let stale = refresh_products(&*self.prices.read().await);
        if stale.is_empty() {
            return Ok(0);
        }

        let updates = self
            .fetch_in_batches(&stale, self.config.refresh_batch_size)
            .await;
        self.write_local(&updates, PriceSource::CoinbaseRefresh).await;
        self.store.merge(PriceSource::CoinbaseRefresh, &updates);
        Ok(updates.len())
    }

    async fn local_prices(&self) -> Vec<PriceRecord> {
        sorted_records(&*self.prices.read().await)
    }

    async fn tokens_tracked(&self) -> usize {
        self.prices.read().await.len()
    }

    fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let lifecycle = {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.bootstrap().await {
                    client.events.error(SOURCE, "bootstrap", e);
                }
                client.run_refresh_loop().await;
            })
        };
        let stream = tokio::spawn(self.run_stream());
        vec![lifecycle, stream]
    }
}

/// [time (s), low, high, open, close, volume]
fn parse_candle_row(row: &[f64]) -> Option<Candle> {
    if row.len() < 6 {
        return None;
    }
    Some(Candle {
        timestamp: (row[0] as i64) * 1000,
        low: row[1],
        high: row[2],
        open: row[3],
        close: row[4],
        volume: row[5],
    })
}
