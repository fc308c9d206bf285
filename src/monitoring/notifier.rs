//! Alert delivery channels (spec.md §4.I).
//!
//! `Webhook`/`Slack`/`Teams` post over HTTP with `reqwest`, matching
//! the provider-SDK-as-opaque-HTTP-client style the pack's
//! `aws-sdk-s3` usage established for the media store; `Email` delegates
//! to an injected [`MailTransport`] so the engine itself never depends
//! on an SMTP crate.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::monitoring::TriggeredAlert;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mail transport error: {0}")]
    Mail(String),
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, target: &str, alert: &TriggeredAlert) -> Result<(), NotifyError>;
}

pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, target: &str, alert: &TriggeredAlert) -> Result<(), NotifyError> {
        self.client.post(target).json(alert).send().await?.error_for_status()?;
        Ok(())
    }
}

pub struct SlackNotifier {
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AlertNotifier for SlackNotifier {
    async fn notify(&self, target: &str, alert: &TriggeredAlert) -> Result<(), NotifyError> {
        let body = serde_json::json!({ "text": alert.message });
        self.client.post(target).json(&body).send().await?.error_for_status()?;
        Ok(())
    }
}

pub struct TeamsNotifier {
    client: reqwest::Client,
}

impl TeamsNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AlertNotifier for TeamsNotifier {
    async fn notify(&self, target: &str, alert: &TriggeredAlert) -> Result<(), NotifyError> {
        let body = serde_json::json!({ "text": alert.message, "title": format!("Alert: {}", alert.rule_id) });
        self.client.post(target).json(&body).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Injected collaborator so `EmailNotifier` doesn't pull in an SMTP
/// stack directly (spec.md §4.I "Email delegates to a mail transport").
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

pub struct EmailNotifier<T: MailTransport> {
    transport: T,
}

impl<T: MailTransport> EmailNotifier<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: MailTransport> AlertNotifier for EmailNotifier<T> {
    async fn notify(&self, target: &str, alert: &TriggeredAlert) -> Result<(), NotifyError> {
        self.transport.send(target, &format!("Alert: {}", alert.rule_id), &alert.message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTransport {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MailTransport for CountingTransport {
        async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn email_notifier_delegates_to_transport() {
        let sent = Arc::new(AtomicUsize::new(0));
        let notifier = EmailNotifier::new(CountingTransport { sent: sent.clone() });

        let alert = TriggeredAlert {
            id: "a1".into(),
            rule_id: "r1".into(),
            metric_value: 1.0,
            message: "boom".into(),
            details: serde_json::json!({}),
            triggered_at: chrono::Utc::now(),
            state: crate::models::monitoring::AlertState::Active,
            acknowledged_by: None,
            acknowledged_at: None,
            ack_notes: None,
        };

        notifier.notify("oncall@example.com", &alert).await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }
}
