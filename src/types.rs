//! Core types used throughout Coinboard
//!
//! Defines the price record exchanged between source adapters and the
//! global price store, plus the source tags and their priority tiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Price source identifier
///
/// Sub-variants (`-ws`, `-refresh`) record how a price was obtained; the
/// store only looks at the [`SourceTier`] when deciding whether to overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
    Coinranking,
    Binance,
    BinanceWs,
    BinanceRefresh,
    Coinbase,
    CoinbaseWs,
    CoinbaseRefresh,
}

impl PriceSource {
    /// Priority tier this tag belongs to
    pub fn tier(&self) -> SourceTier {
        match self {
            PriceSource::Coinranking => SourceTier::Coinranking,
            PriceSource::Binance | PriceSource::BinanceWs | PriceSource::BinanceRefresh => {
                SourceTier::Binance
            }
            PriceSource::Coinbase | PriceSource::CoinbaseWs | PriceSource::CoinbaseRefresh => {
                SourceTier::Coinbase
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Coinranking => "coinranking",
            PriceSource::Binance => "binance",
            PriceSource::BinanceWs => "binance-ws",
            PriceSource::BinanceRefresh => "binance-refresh",
            PriceSource::Coinbase => "coinbase",
            PriceSource::CoinbaseWs => "coinbase-ws",
            PriceSource::CoinbaseRefresh => "coinbase-refresh",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge priority. Ordering is significant: a higher tier always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Coinranking,
    Coinbase,
    Binance,
}

/// One current price for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    pub symbol: String,
    pub price: f64,
    pub source: PriceSource,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume24h: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change24h: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<String>,
}

/// Normalized update produced by a source adapter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub pair: Option<String>,
    pub volume24h: Option<String>,
    pub change24h: Option<String>,
    pub market_cap: Option<String>,
    /// Event time in milliseconds, if the venue supplied one
    pub timestamp: Option<i64>,
}

impl PriceUpdate {
    pub fn new(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            ..Default::default()
        }
    }

    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = Some(pair.into());
        self
    }

    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Build the stored record, stamping wall-clock time if no event time was given
    pub fn into_record(self, symbol: String, source: PriceSource, now_ms: i64) -> PriceRecord {
        PriceRecord {
            symbol,
            price: self.price,
            source,
            timestamp: self.timestamp.unwrap_or(now_ms),
            pair: self.pair,
            volume24h: self.volume24h,
            change24h: self.change24h,
            market_cap: self.market_cap,
        }
    }
}

/// Uppercase a ticker and strip anything that is not ASCII alphanumeric
pub fn canonical_symbol(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parse a price that upstream APIs deliver either as a JSON string or number
pub fn parse_price(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
