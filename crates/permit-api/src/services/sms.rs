use async_trait::async_trait;
use permit_core::notify::{Notifier, NotifierReceipt, NotifyError};
use serde::Deserialize;

use crate::config::SmsConfig;

/// SMS provider reached over its form-encoded HTTP API.
#[derive(Clone)]
pub struct HttpSmsNotifier {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    #[serde(default)]
    message_id: Option<serde_json::Value>,
}

impl HttpSmsNotifier {
    /// `None` when no API key is configured.
    pub fn from_config(config: &SmsConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: super::http_client()?,
            api_url: config.api_url.clone(),
            api_key,
            sender: config.sender.clone(),
        }))
    }
}

#[async_trait]
impl Notifier for HttpSmsNotifier {
    async fn send(&self, phone: &str, message: &str) -> Result<NotifierReceipt, NotifyError> {
        let form = [
            ("apikey", self.api_key.as_str()),
            ("number", phone),
            ("message", message),
            ("sendername", self.sender.as_str()),
        ];

        let response = self
            .client
            .post(&self.api_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "sms provider rejected message");
            return Err(NotifyError::Rejected(format!("{status}: {body}")));
        }

        // Provider answers with a list of queued messages.
        let sent: Vec<SentMessage> = response.json().await.unwrap_or_default();
        let message_id = sent
            .into_iter()
            .find_map(|m| m.message_id)
            .map(|id| match id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });

        tracing::debug!(message_id = ?message_id, "sms queued");
        Ok(NotifierReceipt { message_id })
    }
}
