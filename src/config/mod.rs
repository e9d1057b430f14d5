//! Configuration management for Coinboard
//!
//! Loads from optional config files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub http: HttpConfig,
    pub binance: BinanceConfig,
    pub coinbase: CoinbaseConfig,
    pub coinranking: CoinrankingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API
    pub host: String,
    pub port: u16,
    /// Capacity of the price broadcast channel feeding `/ws` clients
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout for every outbound REST call
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceConfig {
    pub enabled: bool,
    pub rest_url: String,
    pub ws_url: String,
    /// Number of bootstrapped symbols that get a live ticker stream
    pub top_n: usize,
    pub refresh_interval_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Reconnect a stream that has sent no data frame for this long
    pub stale_after_ms: u64,
    pub min_request_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseConfig {
    pub enabled: bool,
    pub rest_url: String,
    pub ws_url: String,
    /// Products fetched per batch during bootstrap
    pub batch_size: usize,
    /// Products fetched per batch during periodic refresh
    pub refresh_batch_size: usize,
    pub batch_delay_ms: u64,
    pub refresh_interval_secs: u64,
    pub reconnect_delay_ms: u64,
    pub stale_after_ms: u64,
    pub min_request_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinrankingConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Requests allowed per sliding window
    pub requests_per_window: usize,
    pub window_ms: u64,
    pub cache_ttl_secs: u64,
    pub retry_base_delay_ms: u64,
    pub max_retries: u32,
    pub page_size: usize,
    pub bootstrap_pages: usize,
    pub refresh_interval_secs: u64,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::with_defaults(Config::builder())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (COINBOARD__*)
            .add_source(Environment::with_prefix("COINBOARD").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Built-in defaults only, without files or environment
    pub fn defaults() -> Result<Self> {
        Self::with_defaults(Config::builder())?
            .build()
            .context("Failed to build default configuration")?
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    fn with_defaults(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>> {
        Ok(builder
            // Server defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3001)?
            .set_default("server.broadcast_capacity", 64)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // HTTP defaults
            .set_default("http.timeout_secs", 15)?
            // Binance defaults
            .set_default("binance.enabled", true)?
            .set_default("binance.rest_url", "https://api.binance.com")?
            .set_default("binance.ws_url", "wss://stream.binance.com:9443/ws")?
            .set_default("binance.top_n", 50)?
            .set_default("binance.refresh_interval_secs", 300)?
            .set_default("binance.reconnect_delay_ms", 10_000)?
            .set_default("binance.stale_after_ms", 30_000)?
            .set_default("binance.min_request_interval_ms", 100)?
            // Coinbase defaults
            .set_default("coinbase.enabled", true)?
            .set_default("coinbase.rest_url", "https://api.exchange.coinbase.com")?
            .set_default("coinbase.ws_url", "wss://ws-feed.exchange.coinbase.com")?
            .set_default("coinbase.batch_size", 10)?
            .set_default("coinbase.refresh_batch_size", 5)?
            .set_default("coinbase.batch_delay_ms", 1000)?
            .set_default("coinbase.refresh_interval_secs", 900)?
            .set_default("coinbase.reconnect_delay_ms", 10_000)?
            .set_default("coinbase.stale_after_ms", 30_000)?
            .set_default("coinbase.min_request_interval_ms", 350)?
            // Coinranking defaults
            .set_default("coinranking.enabled", true)?
            .set_default("coinranking.base_url", "https://coinranking1.p.rapidapi.com")?
            .set_default("coinranking.requests_per_window", 50)?
            .set_default("coinranking.window_ms", 60_000)?
            .set_default("coinranking.cache_ttl_secs", 30)?
            .set_default("coinranking.retry_base_delay_ms", 5000)?
            .set_default("coinranking.max_retries", 4)?
            .set_default("coinranking.page_size", 100)?
            .set_default("coinranking.bootstrap_pages", 10)?
            .set_default("coinranking.refresh_interval_secs", 300)?)
    }

    /// Reject settings that would stall a loop or divide by zero
    pub fn validate(&self) -> Result<()> {
        if self.http.timeout_secs == 0 {
            bail!("http.timeout_secs must be greater than zero");
        }
        if self.binance.refresh_interval_secs == 0 || self.coinbase.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than zero");
        }
        if self.binance.stale_after_ms == 0 || self.coinbase.stale_after_ms == 0 {
            bail!("stale_after_ms must be greater than zero");
        }
        if self.coinbase.batch_size == 0 || self.coinbase.refresh_batch_size == 0 {
            bail!("coinbase batch sizes must be greater than zero");
        }
        if self.coinranking.requests_per_window == 0 || self.coinranking.window_ms == 0 {
            bail!("coinranking rate limit window must allow at least one request");
        }
        if self.coinranking.page_size == 0 || self.coinranking.refresh_interval_secs == 0 {
            bail!("coinranking page_size and refresh_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "listen={}:{} binance={} (top_n={}) coinbase={} coinranking={} ({}/{}ms)",
            self.server.host,
            self.server.port,
            self.binance.enabled,
            self.binance.top_n,
            self.coinbase.enabled,
            self.coinranking.enabled,
            self.coinranking.requests_per_window,
            self.coinranking.window_ms
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

/// First non-empty value among the given environment variables
pub fn resolve_env(var_names: &[&str]) -> Option<String> {
    for var in var_names {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::defaults().unwrap();
        assert_eq!(config.binance.top_n, 50);
        assert_eq!(config.binance.refresh_interval_secs, 300);
        assert_eq!(config.binance.reconnect_delay_ms, 10_000);
        assert_eq!(config.binance.stale_after_ms, 30_000);
        assert_eq!(config.coinbase.stale_after_ms, 30_000);
        assert_eq!(config.coinbase.batch_size, 10);
        assert_eq!(config.coinbase.refresh_batch_size, 5);
        assert_eq!(config.coinbase.refresh_interval_secs, 900);
        assert_eq!(config.coinranking.requests_per_window, 50);
        assert_eq!(config.coinranking.window_ms, 60_000);
        assert_eq!(config.coinranking.cache_ttl_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = AppConfig::defaults().unwrap();
        config.coinbase.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_silence_threshold() {
        let mut config = AppConfig::defaults().unwrap();
        config.binance.stale_after_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_digest_has_no_secrets() {
        let config = AppConfig::defaults().unwrap();
        let digest = config.to_string();
        assert!(digest.contains("top_n=50"));
        assert!(!digest.to_lowercase().contains("key"));
    }
}
