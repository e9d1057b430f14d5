//! Coinbase REST request signing
//!
//! `CB-ACCESS-SIGN` is base64(HMAC-SHA256(timestamp + METHOD + path + body))
//! keyed with the base64-decoded API secret.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;

use crate::config::resolve_env;

/// API credentials for authenticated Coinbase calls
#[derive(Clone)]
pub struct CoinbaseCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl CoinbaseCredentials {
    /// Read COINBASE_API_KEY / COINBASE_API_SECRET / COINBASE_API_PASSPHRASE
    pub fn from_env() -> Option<Self> {
        let api_key = resolve_env(&["COINBASE_API_KEY"])?;
        let api_secret = resolve_env(&["COINBASE_API_SECRET"])?;
        Some(Self {
            api_key,
            api_secret,
            passphrase: resolve_env(&["COINBASE_API_PASSPHRASE"]),
        })
    }

    pub fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> Result<String> {
        let message = format!(
            "{}{}{}{}",
            timestamp,
            method.to_uppercase(),
            request_path,
            body
        );

        let secret_bytes = general_purpose::STANDARD
            .decode(self.api_secret.trim())
            .context("Failed to decode COINBASE_API_SECRET as base64")?;

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .context("Failed to initialize HMAC for Coinbase signature")?;
        mac.update(message.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Build the CB-ACCESS-* header set for one request
    pub fn headers(&self, method: &str, request_path: &str, body: &str) -> Result<HeaderMap> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.headers_at(&timestamp, method, request_path, body)
    }

    fn headers_at(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<HeaderMap> {
        let signature = self.sign(timestamp, method, request_path, body)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "CB-ACCESS-KEY",
            HeaderValue::from_str(&self.api_key).context("Invalid CB-ACCESS-KEY header value")?,
        );
        headers.insert(
            "CB-ACCESS-SIGN",
            HeaderValue::from_str(&signature).context("Invalid CB-ACCESS-SIGN header value")?,
        );
        headers.insert(
            "CB-ACCESS-TIMESTAMP",
            HeaderValue::from_str(timestamp).context("Invalid CB-ACCESS-TIMESTAMP header value")?,
        );
        if let Some(passphrase) = &self.passphrase {
            headers.insert(
                "CB-ACCESS-PASSPHRASE",
                HeaderValue::from_str(passphrase)
                    .context("Invalid CB-ACCESS-PASSPHRASE header value")?,
            );
        }
        Ok(headers)
    }
}

impl std::fmt::Debug for CoinbaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}
