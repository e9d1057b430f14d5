//! Price source implementations (Binance, Coinbase, Coinranking)

mod binance;
mod coinbase;
mod coinranking;

pub use binance::{is_valid_interval, parse_ticker_message, BinanceClient, Kline, KLINE_INTERVALS};
pub use coinbase::{compute_change_24h, is_valid_product_id, Candle, CoinbaseClient};
pub use coinranking::{is_valid_coin_id, CoinrankingClient, CoinrankingMetadata};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::PriceRecord;

/// Lifecycle shared by every source adapter
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Initial fetch populating the local table and the global store
    async fn bootstrap(&self) -> Result<usize>;

    /// Periodic re-poll of already known symbols
    async fn refresh(&self) -> Result<usize>;

    /// Local per-source table sorted by symbol
    async fn local_prices(&self) -> Vec<PriceRecord>;

    async fn tokens_tracked(&self) -> usize;

    /// Start background tasks (bootstrap, streams, refresh timer)
    fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>>;
}

/// Events from price sources
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Connected {
        source: &'static str,
        stream: String,
    },
    Disconnected {
        source: &'static str,
        stream: String,
    },
    Reconnecting {
        source: &'static str,
        stream: String,
        delay_ms: u64,
    },
    /// A background failure that was recovered from
    Error {
        source: &'static str,
        context: String,
        error: String,
    },
}

/// Non-blocking sender for source events; a full or missing channel drops events
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SourceEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SourceEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SourceEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                tracing::trace!(error = %e, "Source event dropped");
            }
        }
    }

    pub fn error(&self, source: &'static str, context: impl Into<String>, error: impl ToString) {
        self.emit(SourceEvent::Error {
            source,
            context: context.into(),
            error: error.to_string(),
        });
    }
}

/// Drain source events into the log
pub fn spawn_event_logger(mut rx: mpsc::Receiver<SourceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SourceEvent::Connected { source, stream } => {
                    tracing::info!(source = %source, stream = %stream, "Stream connected");
                }
                SourceEvent::Disconnected { source, stream } => {
                    tracing::warn!(source = %source, stream = %stream, "Stream disconnected");
                }
                SourceEvent::Reconnecting {
                    source,
                    stream,
                    delay_ms,
                } => {
                    tracing::info!(
                        source = %source,
                        stream = %stream,
                        delay_ms,
                        "Reconnecting stream"
                    );
                }
                SourceEvent::Error {
                    source,
                    context,
                    error,
                } => {
                    tracing::warn!(source = %source, context = %context, error = %error, "Source error");
                }
            }
        }
    })
}

/// True once a stream has gone `silence` without a data frame
pub fn should_reconnect_due_to_silence(last_message: tokio::time::Instant, silence: Duration) -> bool {
    last_message.elapsed() >= silence
}

/// How often a stream checks its silence deadline
pub fn watchdog_period(silence: Duration) -> Duration {
    (silence / 4).clamp(Duration::from_millis(10), Duration::from_secs(5))
}

/// Shared HTTP client with a per-request timeout
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("coinboard/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sink_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        sink.error("Binance", "bootstrap", "boom");

        assert_eq!(
            rx.recv().await.unwrap(),
            SourceEvent::Error {
                source: "Binance",
                context: "bootstrap".to_string(),
                error: "boom".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_deadline() {
        let last = tokio::time::Instant::now();
        let silence = Duration::from_secs(30);
        assert!(!should_reconnect_due_to_silence(last, silence));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!should_reconnect_due_to_silence(last, silence));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(should_reconnect_due_to_silence(last, silence));
    }

    #[test]
    fn test_watchdog_period_bounds() {
        assert_eq!(watchdog_period(Duration::from_secs(30)), Duration::from_secs(5));
        assert_eq!(watchdog_period(Duration::from_secs(8)), Duration::from_secs(2));
        assert_eq!(watchdog_period(Duration::from_millis(20)), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_event_sink_never_blocks_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        for _ in 0..10 {
            sink.error("Coinbase", "ws", "x");
        }
        EventSink::disabled().error("Coinbase", "ws", "x");
    }
}
