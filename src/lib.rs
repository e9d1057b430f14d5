//! Coinboard Library
//!
//! Multi-source crypto price reconciliation behind a dashboard API

pub mod config;
pub mod dashboard;
pub mod error;
pub mod oracle;
pub mod telemetry;
pub mod types;
