//! Outbound user messages.
//!
//! The notifier hands rendered text to a [`MessageSender`]. Production uses
//! the Telegram Bot API; tests use [`RecordingSender`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery transport failed: {0}")]
    Transport(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// Capability to deliver a rendered message to a user.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), DeliveryError>;
}

/// Sends messages through the Telegram Bot API `sendMessage` method.
#[derive(Debug, Clone)]
pub struct TelegramSender {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramSender {
    /// # Errors
    ///
    /// Returns [`DeliveryError::Transport`] if the HTTP client cannot be built.
    pub fn new(bot_token: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(format!("HTTP client error: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
        })
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "chat_id": user_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let body = response
            .json::<TelegramResponse>()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        if body.ok {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(
                body.description.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

/// Keeps every sent message in memory. Can be switched to fail.
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<(i64, String)>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = failing;
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), DeliveryError> {
        if *self.failing.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(DeliveryError::Transport("recording sender set to fail".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((user_id, text.to_string()));
        Ok(())
    }
}
