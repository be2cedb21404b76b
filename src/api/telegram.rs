use async_trait::async_trait;
use reqwest::Client;

use super::SignalSink;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Posts trade notifications to a Telegram chat via the Bot API.
///
/// Strictly fire-and-forget from the caller's point of view: the position
/// controller logs failures and moves on.
#[derive(Clone)]
pub struct TelegramNotifier {
    http: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            http: Client::new(),
            base_url: TELEGRAM_API_BASE.to_string(),
            token,
            chat_id,
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: String, token: String, chat_id: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token,
            chat_id,
        }
    }
}

#[async_trait]
impl SignalSink for TelegramNotifier {
    async fn notify(&self, text: &str) -> anyhow::Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        self.http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Sink used when no notification target is configured.
pub struct NoopSink;

#[async_trait]
impl SignalSink for NoopSink {
    async fn notify(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
