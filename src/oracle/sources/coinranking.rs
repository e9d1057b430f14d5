//! Coinranking (RapidAPI) adapter
//!
//! Widest symbol universe and the priority floor of the global store. Every
//! call goes through a FIFO queue gated by a sliding-window limiter, repeated
//! queries are answered from a short-lived cache, and every `/coins`-shaped
//! response is pushed to the store as a side effect.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::{resolve_env, CoinrankingConfig};
use crate::error::{SourceError, SourceResult};
use crate::oracle::queue::{CacheStats, RequestQueue, ResponseCache};
use crate::oracle::rate_limit::{RateLimiterStats, SlidingWindowLimiter};
use crate::oracle::sources::{EventSink, SourceAdapter};
use crate::oracle::store::{sorted_records, PriceStore};
use crate::types::{canonical_symbol, now_millis, parse_price, PriceRecord, PriceSource, PriceUpdate};

const SOURCE: &str = "Coinranking";
const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// Introspection echoed by every coinranking endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinrankingMetadata {
    pub cache: CacheStats,
    pub rate_limiter: RateLimiterStats,
}

pub struct CoinrankingClient {
    config: CoinrankingConfig,
    http: reqwest::Client,
    api_key: Option<String>,
    api_host: String,
    limiter: Arc<SlidingWindowLimiter>,
    queue: RequestQueue,
    cache: ResponseCache,
    store: Arc<PriceStore>,
    events: EventSink,
    prices: RwLock<HashMap<String, PriceRecord>>,
}

impl CoinrankingClient {
    /// Must be called inside a Tokio runtime (spawns the queue worker)
    pub fn new(
        config: CoinrankingConfig,
        http: reqwest::Client,
        api_key: Option<String>,
        store: Arc<PriceStore>,
        events: EventSink,
    ) -> Self {
        if api_key.is_none() {
            tracing::warn!(source = %SOURCE, "RAPID_API_KEY not set, coinranking requests disabled");
        }

        let api_host = resolve_env(&["RAPID_API_HOST"]).unwrap_or_else(|| {
            config
                .base_url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        });

        let limiter = Arc::new(SlidingWindowLimiter::new(
            config.requests_per_window,
            Duration::from_millis(config.window_ms),
        ));
        let queue = RequestQueue::new(limiter.clone());
        let cache = ResponseCache::new(Duration::from_secs(config.cache_ttl_secs));

        Self {
            config,
            http,
            api_key,
            api_host,
            limiter,
            queue,
            cache,
            store,
            events,
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Cached, queued, rate-limited GET against the coinranking API
    pub async fn request(&self, endpoint: &str, params: Value) -> SourceResult<Value> {
        let key = ResponseCache::key(endpoint, &params);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let api_key = self
            .api_key
            .clone()
            .ok_or(SourceError::MissingCredentials("RAPID_API_KEY"))?;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let query = query_pairs(&params);

        let value = retry_on_throttle(
            self.config.max_retries,
            Duration::from_millis(self.config.retry_base_delay_ms),
            || {
                let http = self.http.clone();
                let url = url.clone();
                let query = query.clone();
                let api_key = api_key.clone();
                let api_host = self.api_host.clone();
                self.queue
                    .enqueue(move || fetch_once(http, url, query, api_key, api_host))
            },
        )
        .await?;

        self.ingest(&value).await;
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    /// Push any coin list in the payload to the local table and the store
    pub(crate) async fn ingest(&self, value: &Value) -> usize {
        let updates = parse_coins(value);
        if updates.is_empty() {
            return 0;
        }

        let now = now_millis();
        {
            let mut prices = self.prices.write().await;
            for update in &updates {
                prices.insert(
                    update.symbol.clone(),
                    update
                        .clone()
                        .into_record(update.symbol.clone(), PriceSource::Coinranking, now),
                );
            }
        }
        let outcome = self.store.update_from_coinranking(&updates);
        tracing::debug!(
            source = %SOURCE,
            applied = outcome.applied,
            skipped = outcome.skipped,
            "Merged coin list"
        );
        updates.len()
    }

    pub async fn get_coins(&self, limit: usize, offset: usize) -> SourceResult<Value> {
        self.request("/coins", json!({ "limit": limit, "offset": offset }))
            .await
    }

    pub async fn get_coin(&self, uuid: &str) -> SourceResult<Value> {
        check_coin_id(uuid)?;
        self.request(&format!("/coin/{}", uuid), json!({})).await
    }

    pub async fn get_coin_history(&self, uuid: &str, time_period: &str) -> SourceResult<Value> {
        check_coin_id(uuid)?;
        self.request(
            &format!("/coin/{}/history", uuid),
            json!({ "timePeriod": time_period }),
        )
        .await
    }

    pub async fn get_stats(&self) -> SourceResult<Value> {
        self.request("/stats", json!({})).await
    }

    /// Fetch many coins through the queue; failed lookups are left out
    pub async fn batch_coins(&self, ids: &[String]) -> HashMap<String, Value> {
        let results = join_all(ids.iter().map(|id| self.get_coin(id))).await;

        ids.iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(value) => Some((id.clone(), value)),
                Err(e) => {
                    tracing::debug!(source = %SOURCE, id = %id, error = %e, "Batch coin lookup failed");
                    None
                }
            })
            .collect()
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats(self.queue.len())
    }

    pub fn metadata(&self) -> CoinrankingMetadata {
        CoinrankingMetadata {
            cache: self.cache_stats(),
            rate_limiter: self.limiter_stats(),
        }
    }

    /// Page through the coin list; only a first-page failure is an error
    async fn load_pages(&self) -> Result<usize> {
        let page_size = self.config.page_size;
        let mut total = 0;

        for page in 0..self.config.bootstrap_pages {
            match self.get_coins(page_size, page * page_size).await {
                Ok(value) => {
                    let count = coin_count(&value);
                    total += count;
                    if count < page_size {
                        break;
                    }
                }
                Err(e) if page == 0 => return Err(e.into()),
                Err(e) => {
                    self.events.error(SOURCE, format!("coins page {}", page), e);
                    break;
                }
            }
        }
        Ok(total)
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.refresh_interval_secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            interval.tick().await;
            match self.refresh().await {
                Ok(count) => tracing::debug!(source = %SOURCE, count, "Periodic refresh done"),
                Err(e) => self.events.error(SOURCE, "refresh", e),
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for CoinrankingClient {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn bootstrap(&self) -> Result<usize> {
        let count = self.load_pages().await?;
        tracing::info!(source = %SOURCE, count, "Bootstrapped coin list");
        Ok(count)
    }

    async fn refresh(&self) -> Result<usize> {
        self.load_pages().await
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
            if let Err(e) = client.bootstrap().await {
                client.events.error(SOURCE, "bootstrap", e);
            }
            client.run_refresh_loop().await;
        });
        vec![handle]
    }
}

const MAX_COIN_ID_LEN: usize = 64;

/// Coin uuids are short alphanumeric tokens; anything else never reaches the URL path
pub fn is_valid_coin_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_COIN_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn check_coin_id(id: &str) -> SourceResult<()> {
    if is_valid_coin_id(id) {
        Ok(())
    } else {
        Err(SourceError::InvalidId(id.to_string()))
    }
}

async fn fetch_once(
    http: reqwest::Client,
    url: String,
    query: Vec<(String, String)>,
    api_key: String,
    api_host: String,
) -> SourceResult<Value> {
    let response = http
        .get(&url)
        .query(&query)
        .header("X-RapidAPI-Key", api_key)
        .header("X-RapidAPI-Host", api_host)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SourceError::UnexpectedStatus {
            source_name: SOURCE,
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Delay before retry number `attempt` (0-based): base * 2^attempt
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Run `op`, retrying HTTP 429 with exponential backoff up to `max_retries` times
async fn retry_on_throttle<F, Fut>(max_retries: u32, base: Duration, mut op: F) -> SourceResult<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SourceResult<Value>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(SourceError::UnexpectedStatus { status, .. })
                if status == HTTP_TOO_MANY_REQUESTS =>
            {
                if attempt >= max_retries {
                    return Err(SourceError::RateLimited {
                        source_name: SOURCE,
                        attempts: attempt + 1,
                    });
                }
                let delay = backoff_delay(base, attempt);
                tracing::warn!(
                    source = %SOURCE,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Throttled (429), retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn query_pairs(params: &Value) -> Vec<(String, String)> {
    params
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn coin_count(value: &Value) -> usize {
    value["data"]["coins"].as_array().map_or(0, Vec::len)
}

/// Extract `{symbol, price, marketCap, change, 24hVolume}` from a coins payload
fn parse_coins(value: &Value) -> Vec<PriceUpdate> {
    let Some(coins) = value["data"]["coins"].as_array() else {
        return Vec::new();
    };

    let text = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    coins
        .iter()
        .filter_map(|coin| {
            let symbol = canonical_symbol(coin["symbol"].as_str()?);
            let price = parse_price(&coin["price"])?;
            Some(PriceUpdate {
                symbol,
                price,
                pair: None,
                volume24h: text(&coin["24hVolume"]),
                change24h: text(&coin["change"]),
                market_cap: text(&coin["marketCap"]),
                timestamp: None,
            })
        })
        .collect()
}
