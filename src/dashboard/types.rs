//! Dashboard API Types
//!
//! DTOs for HTTP/WebSocket communication with the dashboard frontend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::oracle::sources::CoinrankingMetadata;
use crate::oracle::StoreStats;
use crate::types::PriceRecord;

// ─────────────────────────────────────────────────────────────────
// Price tables
// ─────────────────────────────────────────────────────────────────

/// Merged (`/api/prices`) or per-exchange price table
#[derive(Debug, Clone, Serialize)]
pub struct PricesResponse {
    pub success: bool,
    pub count: usize,
    pub data: Vec<PriceRecord>,
    /// Only present on the merged table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StoreStats>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeHealthResponse {
    pub success: bool,
    pub exchange: String,
    pub status: &'static str,
    pub tokens_tracked: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthResponse {
    pub success: bool,
    pub status: &'static str,
    pub timestamp: i64,
}

// ─────────────────────────────────────────────────────────────────
// Coinranking pass-through
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CoinrankingResponse {
    pub success: bool,
    pub data: Value,
    pub metadata: CoinrankingMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchCoinsRequest {
    pub ids: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────
// Query parameters
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct KlinesQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub product_id: Option<String>,
    pub granularity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CoinsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub time_period: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// Generic envelope
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// WebSocket Message Types
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WsMessage {
    /// Full merged table (sent on connect)
    Snapshot(Vec<PriceRecord>),
    /// Merged table after a store update
    Prices(Vec<PriceRecord>),
}
