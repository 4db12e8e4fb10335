//! sink.rs — Outbound messaging boundary.
//!
//! The pipeline only knows `send(chat_id, html) → ok | error`; the Telegram
//! Bot API implementation lives behind the trait so tests can substitute a
//! recording sink.

use crate::error::SinkError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver an HTML-formatted message to a recipient.
    async fn send(&self, chat_id: i64, html: &str) -> Result<(), SinkError>;
}

/// Telegram Bot API sink (`sendMessage` with HTML parse mode).
pub struct TelegramSink {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramSink {
    pub fn new(bot_token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
        })
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn send(&self, chat_id: i64, html: &str) -> Result<(), SinkError> {
        let payload = json!({
            "chat_id": chat_id,
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(chat_id, "message delivered");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        // 400/403 mean the recipient is gone or the payload is bad; retrying
        // cannot help. 429 and 5xx are worth another attempt.
        if status.as_u16() == 400 || status.as_u16() == 403 || status.as_u16() == 404 {
            Err(SinkError::Permanent(format!("{status}: {body}")))
        } else {
            Err(SinkError::Transient(format!("{status}: {body}")))
        }
    }
}
