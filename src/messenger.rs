//! Outbound notification collaborators.
//!
//! Delivery calls are fallible network I/O: 2xx responses count as
//! success, everything else is a delivery failure the caller may retry.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::TelegramConfig;
use crate::store::UserId;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("MessengerError - Transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("MessengerError - Delivery: status {status}: {body}")]
    Delivery { status: u16, body: String },
}

#[async_trait]
/// Delivers support-facing messages to the operator channel.
pub trait SupportMessenger: Send + Sync + 'static {
    async fn send(&self, text: &str) -> Result<(), MessengerError>;
}

#[async_trait]
/// Delivers user-facing notifications. Implementations must report
/// delivery failure explicitly rather than swallowing it.
pub trait UserNotifier: Send + Sync + 'static {
    async fn notify(
        &self,
        user_id: &UserId,
        kind: &str,
        message: &str,
    ) -> Result<(), MessengerError>;
}

/// Support messenger backed by the Telegram bot API.
pub struct TelegramMessenger {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramMessenger {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            bot_token: config.bot_token,
            chat_id: config.chat_id,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SupportMessenger for TelegramMessenger {
    async fn send(&self, text: &str) -> Result<(), MessengerError> {
        let url = format!("{TELEGRAM_API_BASE}/bot{}/sendMessage", self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: &self.chat_id,
                text,
                disable_web_page_preview: true,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MessengerError::Delivery {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
