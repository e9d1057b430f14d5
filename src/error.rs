use thiserror::Error;

/// Failures surfaced by source adapters on the request path
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{source_name} rate limit still exceeded after {attempts} attempts")]
    RateLimited {
        source_name: &'static str,
        attempts: u32,
    },

    #[error("Missing credentials: {0} is not set")]
    MissingCredentials(&'static str),

    #[error("{source_name} returned HTTP {status}: {body}")]
    UnexpectedStatus {
        source_name: &'static str,
        status: u16,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Request queue closed")]
    QueueClosed,
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;
