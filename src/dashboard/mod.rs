//! Dashboard Module
//!
//! HTTP/WebSocket read surface over the global price store and the
//! per-source adapters.

mod api;
mod types;
mod websocket;

pub use api::create_router;
pub use types::*;
pub use websocket::WebSocketBroadcaster;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::error::SourceError;
use crate::oracle::sources::{BinanceClient, CoinbaseClient, CoinrankingClient};
use crate::oracle::PriceStore;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PriceStore>,
    pub binance: Arc<BinanceClient>,
    pub coinbase: Arc<CoinbaseClient>,
    pub coinranking: Arc<CoinrankingClient>,
    pub broadcaster: WebSocketBroadcaster,
}

/// Request-path failure rendered as `{success: false, error}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %format!("{:#}", err), "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
            }
        };
        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::InvalidId(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}
