//! Balance lookup seam and the BscScan-compatible HTTP adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use watch_core::{Address, Balance};

/// Expected lookup failures. None of these are fatal; the reconciliation
/// loop skips the record and tries again next cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("config error: {0}")]
    Config(String),
}

/// Fetch the current balance of an address, in smallest units.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch(&self, address: &Address) -> Result<Balance, BalanceError>;
}

/// Puts a hard deadline on any inner source.
pub struct TimeoutSource {
    inner: Arc<dyn BalanceSource>,
    timeout: Duration,
}

impl TimeoutSource {
    pub fn new(inner: Arc<dyn BalanceSource>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl BalanceSource for TimeoutSource {
    async fn fetch(&self, address: &Address) -> Result<Balance, BalanceError> {
        tokio::time::timeout(self.timeout, self.inner.fetch(address))
            .await
            .map_err(|_| BalanceError::Timeout)?
    }
}

/// Configuration for [`BscScanClient`].
#[derive(Debug, Clone)]
pub struct BscScanConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for BscScanConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bscscan.com".to_string(),
            api_key: None,
            timeout_ms: 10_000,
        }
    }
}

/// Etherscan-family `account/balance` client.
#[derive(Debug, Clone)]
pub struct BscScanClient {
    cfg: BscScanConfig,
    client: reqwest::Client,
}

impl BscScanClient {
    pub fn new(cfg: BscScanConfig) -> Result<Self, BalanceError> {
        if cfg.base_url.trim().is_empty() {
            return Err(BalanceError::Config("base_url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| BalanceError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn endpoint(&self) -> String {
        let base = self.cfg.base_url.trim_end_matches('/');
        format!("{base}/api")
    }
}

#[async_trait]
impl BalanceSource for BscScanClient {
    async fn fetch(&self, address: &Address) -> Result<Balance, BalanceError> {
        let mut query = vec![
            ("module", "account"),
            ("action", "balance"),
            ("address", address.as_str()),
            ("tag", "latest"),
        ];
        if let Some(key) = self.cfg.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            query.push(("apikey", key));
        }

        let resp = self
            .client
            .get(self.endpoint())
            .query(&query)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BalanceError::Timeout
                } else {
                    BalanceError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BalanceError::HttpStatus(status.as_u16()));
        }
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                BalanceError::Timeout
            } else {
                BalanceError::Network(e.to_string())
            }
        })?;
        parse_balance_response(&body)
    }
}

#[derive(Debug, Deserialize)]
struct RawBalanceResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: serde_json::Value,
}

/// Parse `{"status":"1","message":"OK","result":"<wei>"}`.
///
/// Rate-limit and validation errors arrive with HTTP 200 and `status: "0"`,
/// the reason in `result`.
pub fn parse_balance_response(body: &str) -> Result<Balance, BalanceError> {
    let parsed: RawBalanceResponse =
        serde_json::from_str(body).map_err(|e| BalanceError::Decode(e.to_string()))?;

    let result = match &parsed.result {
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if parsed.status != "1" {
        return Err(BalanceError::Provider(format!(
            "{}: {}",
            parsed.message.trim(),
            result
        )));
    }
    if result.is_empty() || !result.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BalanceError::Decode(format!("non-integer balance: {result}")));
    }
    result
        .parse::<Balance>()
        .map_err(|e| BalanceError::Decode(format!("balance out of range: {e}")))
}
