//! Push-notification channel.
//!
//! Best-effort from the engine's perspective: a failed or unconfigured
//! notifier logs and returns `false`, it never blocks trading logic.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Bot-API push channel (Telegram-compatible).
pub struct Notifier {
    http: Client,
    channel: Option<Channel>,
}

struct Channel {
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    /// Create from environment variables:
    /// - NOTIFY_BOT_TOKEN
    /// - NOTIFY_CHAT_ID
    ///
    /// Missing configuration disables the channel rather than failing:
    /// alerting is optional, trading is not.
    pub fn from_env() -> Self {
        let bot_token = std::env::var("NOTIFY_BOT_TOKEN").ok();
        let chat_id = std::env::var("NOTIFY_CHAT_ID").ok();

        let channel = match (bot_token, chat_id) {
            (Some(bot_token), Some(chat_id)) => Some(Channel { bot_token, chat_id }),
            _ => {
                warn!("NOTIFY_BOT_TOKEN / NOTIFY_CHAT_ID not set, notifications disabled");
                None
            }
        };

        Self {
            http: Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
            channel,
        }
    }

    /// Disabled notifier, used in tests.
    pub fn disabled() -> Self {
        Self {
            http: Client::new(),
            channel: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// Send a message. Returns `true` on success; failures are logged and
    /// swallowed.
    pub async fn notify(&self, message: &str) -> bool {
        let Some(ref channel) = self.channel else {
            debug!("Notifier disabled, skipping message");
            return false;
        };

        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            channel.bot_token
        );
        let body = json!({
            "chat_id": channel.chat_id,
            "text": message,
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Notification sent");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "Notification rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to send notification");
                false
            }
        }
    }
}
