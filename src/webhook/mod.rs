//! Webhook Delivery Pipeline (spec.md §4.J).
//!
//! `BatchingPublisher` queues deliveries on a bounded `mpsc` channel and
//! drains them in batches (`maxBatchSize` items or `maxBatchDelay`,
//! whichever comes first), fanning each batch out across
//! `concurrentPublishers` workers gated by a semaphore. Every delivery
//! passes through [`WebhookCircuitBreaker`] (per-URL Closed/Open/
//! HalfOpen) and [`DeliveryTracker`] (dedup + stats) before
//! [`WebhookNotifier`] posts it. Grounded on
//! `thichuong-multi-tier-cache`'s bounded-queue-plus-worker-pool shape
//! for the batching publisher; the circuit breaker borrows this crate's
//! own name and domain, generalizing `src/llm/router.rs`'s consecutive-
//! failure counting into explicit states.

mod circuit;
mod delivery;
mod notifier;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BatchingSettings;
use crate::models::webhook::WebhookDelivery;

pub use circuit::WebhookCircuitBreaker;
pub use delivery::DeliveryTracker;
pub use notifier::{WebhookDeliveryError, WebhookNotifier};

/// Queues webhook deliveries and drains them in partition-grouped
/// batches. Cloning shares the same queue (the sender is cheap to
/// clone), so callers can hand `enqueue` access to many producers.
pub struct BatchingPublisher {
    sender: mpsc::Sender<WebhookDelivery>,
}

impl BatchingPublisher {
    /// Spawns the background drain loop and returns a handle whose
    /// `enqueue` is the only public write path; `circuit`/`tracker`/
    /// `notifier` are shared with the loop via `Arc`.
    pub fn spawn(
        settings: BatchingSettings,
        circuit: Arc<WebhookCircuitBreaker>,
        tracker: Arc<DeliveryTracker>,
        notifier: Arc<WebhookNotifier>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.max_batch_size * 4);
        let requeue = sender.clone();
        tokio::spawn(drain_loop(receiver, requeue, settings, circuit, tracker, notifier, cancel));
        Self { sender }
    }

    pub async fn enqueue(&self, delivery: WebhookDelivery) -> Result<(), mpsc::error::SendError<WebhookDelivery>> {
        self.sender.send(delivery).await
    }
}

async fn drain_loop(
    mut receiver: mpsc::Receiver<WebhookDelivery>,
    requeue: mpsc::Sender<WebhookDelivery>,
    settings: BatchingSettings,
    circuit: Arc<WebhookCircuitBreaker>,
    tracker: Arc<DeliveryTracker>,
    notifier: Arc<WebhookNotifier>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(settings.concurrent_publishers.max(1)));
    let batch_delay = std::time::Duration::from_millis(settings.max_batch_delay_ms);

    loop {
        let mut batch = Vec::with_capacity(settings.max_batch_size);
        let deadline = tokio::time::sleep(batch_delay);
        tokio::pin!(deadline);

        loop {
            if batch.len() >= settings.max_batch_size {
                break;
            }
            tokio::select! {
                maybe_item = receiver.recv() => {
                    match maybe_item {
                        Some(item) => batch.push(item),
                        None => {
                            dispatch_batch(batch, &permits, &circuit, &tracker, &notifier, &requeue, settings.max_delivery_attempts).await;
                            return;
                        }
                    }
                }
                _ = &mut deadline => break,
                _ = cancel.cancelled() => {
                    dispatch_batch(batch, &permits, &circuit, &tracker, &notifier, &requeue, settings.max_delivery_attempts).await;
                    return;
                }
            }
        }

        dispatch_batch(batch, &permits, &circuit, &tracker, &notifier, &requeue, settings.max_delivery_attempts).await;
    }
}

/// Groups the batch by `partition_key` (spec.md §4.J "ordered delivery
/// per partition key") and dispatches each group sequentially to
/// preserve in-order delivery within a key, while different partitions
/// run concurrently up to `concurrentPublishers`.
async fn dispatch_batch(
    batch: Vec<WebhookDelivery>,
    permits: &Arc<Semaphore>,
    circuit: &Arc<WebhookCircuitBreaker>,
    tracker: &Arc<DeliveryTracker>,
    notifier: &Arc<WebhookNotifier>,
    requeue: &mpsc::Sender<WebhookDelivery>,
    max_delivery_attempts: u32,
) {
    if batch.is_empty() {
        return;
    }

    let mut partitions: HashMap<String, Vec<WebhookDelivery>> = HashMap::new();
    for delivery in batch {
        partitions.entry(delivery.partition_key.clone()).or_default().push(delivery);
    }

    let mut handles = Vec::new();
    for (_, deliveries) in partitions {
        let permits = permits.clone();
        let circuit = circuit.clone();
        let tracker = tracker.clone();
        let notifier = notifier.clone();
        let requeue = requeue.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permits.acquire().await;
            for delivery in deliveries {
                deliver_one(delivery, &circuit, &tracker, &notifier, &requeue, max_delivery_attempts).await;
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// On error the delivery is re-enqueued onto the publisher's own
/// channel for a later batch (spec.md §4.J "On error, the batch is
/// re-enqueued"), bumping `attempt_count` until `max_delivery_attempts`
/// is reached. Re-enqueued deliveries skip the dedup check below —
/// `mark_seen` already admitted this `delivery_key` on its first pass.
async fn deliver_one(
    mut delivery: WebhookDelivery,
    circuit: &WebhookCircuitBreaker,
    tracker: &DeliveryTracker,
    notifier: &WebhookNotifier,
    requeue: &mpsc::Sender<WebhookDelivery>,
    max_delivery_attempts: u32,
) {
    if delivery.attempt_count == 0 && !tracker.mark_seen(&delivery.delivery_key) {
        debug!(delivery_key = %delivery.delivery_key, "duplicate webhook delivery dropped");
        return;
    }
    if !circuit.allow(&delivery.webhook_url) {
        warn!(url = %delivery.webhook_url, "webhook circuit open, skipping delivery");
        tracker.record_failed(&delivery.webhook_url, "circuit open");
        requeue_failed(delivery, requeue, max_delivery_attempts).await;
        return;
    }

    let header_map: HashMap<String, String> = delivery.headers.clone();
    match notifier.deliver(&delivery.webhook_url, "gateway.webhook", &delivery.payload, Some(&header_map)).await {
        Ok(()) => {
            circuit.record_success(&delivery.webhook_url).await;
            tracker.record_delivered(&delivery.webhook_url);
        }
        Err(err) => {
            circuit.record_failure(&delivery.webhook_url).await;
            tracker.record_failed(&delivery.webhook_url, &err.to_string());
            warn!(url = %delivery.webhook_url, %err, "webhook delivery failed");
            requeue_failed(delivery, requeue, max_delivery_attempts).await;
        }
    }
}

async fn requeue_failed(mut delivery: WebhookDelivery, requeue: &mpsc::Sender<WebhookDelivery>, max_delivery_attempts: u32) {
    delivery.attempt_count += 1;
    if delivery.attempt_count >= max_delivery_attempts {
        warn!(
            delivery_key = %delivery.delivery_key,
            attempts = delivery.attempt_count,
            "webhook delivery exhausted retries, dropping"
        );
        return;
    }
    if requeue.send(delivery).await.is_err() {
        warn!("failed to re-enqueue webhook delivery: drain loop channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(partition_key: &str, delivery_key: &str, url: &str) -> WebhookDelivery {
        WebhookDelivery {
            delivery_key: delivery_key.to_string(),
            webhook_url: url.to_string(),
            payload: json!({"ok": true}),
            partition_key: partition_key.to_string(),
            attempt_count: 0,
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn enqueue_accepts_until_cancelled() {
        let settings = BatchingSettings {
            max_batch_size: 2,
            max_batch_delay_ms: 10,
            concurrent_publishers: 1,
            max_delivery_attempts: 5,
        };
        let cancel = CancellationToken::new();
        let publisher = BatchingPublisher::spawn(
            settings,
            Arc::new(WebhookCircuitBreaker::new(None)),
            Arc::new(DeliveryTracker::new()),
            Arc::new(WebhookNotifier::new()),
            cancel.clone(),
        );

        publisher.enqueue(delivery("p1", "d1", "https://example.invalid/hook")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
    }
}
