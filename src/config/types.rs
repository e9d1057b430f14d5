//! Configuration types and re-exports

pub use super::{
    AppConfig, BinanceConfig, CoinbaseConfig, CoinrankingConfig, HttpConfig, LoggingConfig,
    ServerConfig,
};
