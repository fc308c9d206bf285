//! HTTP delivery (spec.md §4.J `WebhookNotifier`).

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum WebhookDeliveryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("non-success status: {0}")]
    Status(u16),
}

pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build().unwrap_or_default();
        Self { client }
    }

    /// Posts `payload` with `X-Webhook-Type`/`X-Webhook-Timestamp`
    /// headers plus any caller-supplied headers (spec.md §4.J "delivery
    /// envelope").
    pub async fn deliver(
        &self,
        url: &str,
        event_type: &str,
        payload: &Value,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<(), WebhookDeliveryError> {
        let mut request = self
            .client
            .post(url)
            .header("X-Webhook-Type", event_type)
            .header("X-Webhook-Timestamp", Utc::now().to_rfc3339())
            .json(payload);

        if let Some(headers) = headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(WebhookDeliveryError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}
