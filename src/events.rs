//! Gateway event bus (spec.md §6 "Events").
//!
//! Every row of the external-interfaces event table is a variant here.
//! Publication is best-effort: a failed publish is logged and does not
//! fail the caller's primary operation (spec.md §7), matching the
//! teacher's `EventBus::publish` which swallows the broadcast-channel
//! send result (no active subscriber is not an error).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoGenerationParameters {
    pub size: Option<String>,
    pub duration_secs: Option<f64>,
    pub fps: Option<u32>,
    pub style: Option<String>,
    pub response_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    AsyncTaskCreated {
        task_id: uuid::Uuid,
        task_type: String,
        virtual_key_id: String,
    },
    AsyncTaskUpdated {
        task_id: uuid::Uuid,
        state: String,
        progress: u8,
        is_completed: bool,
    },
    VideoGenerationRequested {
        request_id: uuid::Uuid,
        model: String,
        prompt: String,
        virtual_key_id: String,
        is_async: bool,
        webhook_url: Option<String>,
        webhook_headers: Option<HashMap<String, String>>,
        parameters: VideoGenerationParameters,
        correlation_id: uuid::Uuid,
    },
    VideoGenerationProgress {
        request_id: uuid::Uuid,
        progress_percentage: u8,
        status: String,
        message: Option<String>,
        correlation_id: uuid::Uuid,
    },
    VideoProgressCheckRequested {
        request_id: uuid::Uuid,
        checkpoint_percentage: u8,
        correlation_id: uuid::Uuid,
    },
    VideoGenerationCompleted {
        request_id: uuid::Uuid,
        video_url: String,
        completed_at: DateTime<Utc>,
        correlation_id: uuid::Uuid,
    },
    VideoGenerationFailed {
        request_id: uuid::Uuid,
        error: String,
        failed_at: DateTime<Utc>,
        correlation_id: uuid::Uuid,
    },
    VideoGenerationCancelled {
        request_id: uuid::Uuid,
        cancelled_at: DateTime<Utc>,
        correlation_id: uuid::Uuid,
    },
    MediaGenerationCompleted {
        media_type: String,
        virtual_key_id: String,
        media_url: String,
        storage_key: String,
        file_size_bytes: u64,
        content_type: String,
        generated_by_model: String,
        generation_prompt: String,
        generated_at: DateTime<Utc>,
        metadata: HashMap<String, String>,
    },
    WebhookDeliveryRequested {
        partition_key: String,
        delivery_key: String,
        url: String,
        payload: Value,
        headers: Option<HashMap<String, String>>,
    },
    CredentialDisabled {
        key_id: String,
        provider_id: String,
        reason: String,
        disabled_at: DateTime<Utc>,
    },
    CacheEviction {
        key: String,
        region: String,
        reason: String,
        evicted_at: DateTime<Utc>,
    },
    CacheAlertTriggered {
        region: String,
        metric: String,
        value: f64,
        threshold: f64,
        triggered_at: DateTime<Utc>,
    },
}

impl GatewayEvent {
    /// Logical NATS subject this event publishes under. Subjects double
    /// as the message bus's in-order-delivery routing key (spec.md §1's
    /// "message bus treated as pub/sub with in-order delivery per
    /// routing key").
    pub fn subject(&self) -> &'static str {
        match self {
            GatewayEvent::AsyncTaskCreated { .. } => "gateway.tasks.created",
            GatewayEvent::AsyncTaskUpdated { .. } => "gateway.tasks.updated",
            GatewayEvent::VideoGenerationRequested { .. } => "gateway.video.requested",
            GatewayEvent::VideoGenerationProgress { .. } => "gateway.video.progress",
            GatewayEvent::VideoProgressCheckRequested { .. } => "gateway.video.progress_check",
            GatewayEvent::VideoGenerationCompleted { .. } => "gateway.video.completed",
            GatewayEvent::VideoGenerationFailed { .. } => "gateway.video.failed",
            GatewayEvent::VideoGenerationCancelled { .. } => "gateway.video.cancelled",
            GatewayEvent::MediaGenerationCompleted { .. } => "gateway.media.completed",
            GatewayEvent::WebhookDeliveryRequested { .. } => "gateway.webhooks.requested",
            GatewayEvent::CredentialDisabled { .. } => "gateway.providers.credential_disabled",
            GatewayEvent::CacheEviction { .. } => "gateway.cache.eviction",
            GatewayEvent::CacheAlertTriggered { .. } => "gateway.cache.alert",
        }
    }
}

/// Publish-subscribe bus for [`GatewayEvent`].
///
/// Publishes to NATS when configured, always fans out locally over a
/// `tokio::sync::broadcast` channel so in-process consumers (the video
/// orchestrator's own background loop, tests) never depend on an
/// external broker being reachable.
pub struct GatewayEvents {
    local: broadcast::Sender<Arc<GatewayEvent>>,
    nats: Option<async_nats::Client>,
}

impl GatewayEvents {
    pub fn new_local_only() -> Self {
        let (local, _) = broadcast::channel(1024);
        Self { local, nats: None }
    }

    pub fn with_nats(nats: async_nats::Client) -> Self {
        let (local, _) = broadcast::channel(1024);
        Self {
            local,
            nats: Some(nats),
        }
    }

    pub async fn connect(nats_url: &str) -> Self {
        match async_nats::connect(nats_url).await {
            Ok(client) => Self::with_nats(client),
            Err(err) => {
                warn!(%err, "could not connect to NATS, falling back to in-process event bus only");
                Self::new_local_only()
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayEvent>> {
        self.local.subscribe()
    }

    /// Publishes `event`; never returns an error to the caller, since
    /// event publication is a best-effort side effect (spec.md §7).
    pub async fn publish(&self, event: GatewayEvent) {
        let event = Arc::new(event);
        let _ = self.local.send(event.clone());

        if let Some(client) = &self.nats {
            match serde_json::to_vec(event.as_ref()) {
                Ok(bytes) => {
                    if let Err(err) = client.publish(event.subject(), bytes.into()).await {
                        warn!(subject = event.subject(), %err, "failed to publish event to NATS");
                    }
                }
                Err(err) => warn!(%err, "failed to serialize event"),
            }
        }

        debug!(subject = event.subject(), "event published");
    }
}

impl Clone for GatewayEvents {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            nats: self.nats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_subscribers_receive_published_events() {
        let bus = GatewayEvents::new_local_only();
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::CredentialDisabled {
            key_id: "k1".into(),
            provider_id: "p1".into(),
            reason: "test".into(),
            disabled_at: Utc::now(),
        })
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject(), "gateway.providers.credential_disabled");
    }
}
