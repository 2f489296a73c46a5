//! Notification delivery seam plus logging and Telegram adapters.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use watch_core::{format_units, NotificationEvent, NATIVE_DECIMALS, NATIVE_SYMBOL};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("network error: {0}")]
    Network(String),
    #[error("delivery timed out")]
    Timeout,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("rejected by channel: {0}")]
    Rejected(String),
    #[error("config error: {0}")]
    Config(String),
}

/// Deliver a balance change to the subscriber's channel.
///
/// Failures are reported back to the caller, which logs them; the core
/// never retries a delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Human-readable text for a balance change.
pub fn render_change_message(event: &NotificationEvent) -> String {
    format!(
        "The balance of address {} has changed.\nIt is now {} {sym} (was {} {sym}).",
        event.address,
        format_units(event.new_balance, NATIVE_DECIMALS, 4),
        format_units(event.old_balance, NATIVE_DECIMALS, 4),
        sym = NATIVE_SYMBOL,
    )
}

/// Sink that only writes to the log.
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        info!(
            subscriber = %event.subscriber_id,
            address = %event.address,
            old_balance = %event.old_balance,
            new_balance = %event.new_balance,
            "balance changed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub timeout_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            timeout_ms: 10_000,
        }
    }
}

/// Delivers via the Telegram Bot API; the subscriber id is the chat id.
#[derive(Debug, Clone)]
pub struct TelegramSink {
    cfg: TelegramConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramSink {
    pub fn new(cfg: TelegramConfig) -> Result<Self, NotifyError> {
        if cfg.bot_token.trim().is_empty() {
            return Err(NotifyError::Config("bot_token is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn send_message_url(&self) -> String {
        let base = self.cfg.api_base.trim_end_matches('/');
        format!("{base}/bot{}/sendMessage", self.cfg.bot_token.trim())
    }

    /// Send arbitrary text to one chat.
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.send_message_url())
            .json(&SendMessage { chat_id, text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout
                } else {
                    NotifyError::Network(e.to_string())
                }
            })?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let reply = serde_json::from_str::<TelegramReply>(&body).ok();
        match reply {
            Some(r) if r.ok && status.is_success() => Ok(()),
            Some(r) => Err(NotifyError::Rejected(
                r.description.unwrap_or_else(|| format!("status {status}")),
            )),
            None if !status.is_success() => Err(NotifyError::HttpStatus(status.as_u16())),
            None => Err(NotifyError::Rejected("unreadable reply".to_string())),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let text = render_change_message(event);
        self.send_text(event.subscriber_id.as_str(), &text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watch_core::{Address, SubscriberId};

    #[test]
    fn message_uses_four_decimal_places() {
        let event = NotificationEvent {
            subscriber_id: SubscriberId::new("42").unwrap(),
            address: Address::parse("0xb91986a9854be250ac681f6737836945d7aff6fa").unwrap(),
            old_balance: 5_000_000_000_000_000_000,
            new_balance: 4_000_000_000_000_000_000,
        };
        let text = render_change_message(&event);
        assert!(text.contains("0xb91986a9854be250ac681f6737836945d7aff6fa"));
        assert!(text.contains("It is now 4.0000 BNB (was 5.0000 BNB)."));
    }

    #[test]
    fn telegram_sink_requires_token() {
        assert!(matches!(
            TelegramSink::new(TelegramConfig::default()),
            Err(NotifyError::Config(_))
        ));
    }
}
