//! Oracle module - Multi-source price reconciliation
//!
//! Collects prices from Binance, Coinbase and Coinranking and merges them
//! into one authoritative table under a fixed source priority.

pub mod queue;
pub mod rate_limit;
pub mod signing;
pub mod sources;
pub mod store;

pub use queue::{CacheStats, RequestQueue, ResponseCache};
pub use rate_limit::{FixedIntervalLimiter, RateLimiter, RateLimiterStats, SlidingWindowLimiter};
pub use store::{MergeOutcome, PriceStore, StoreStats};
