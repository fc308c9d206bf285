//! Time-based pseudo-progress for providers with no native progress
//! callback (spec.md §4.H "Progress fallback").
//!
//! Emits the fixed checkpoint sequence at a fixed interval onto an
//! `mpsc` channel; the orchestrator races this against the provider's
//! generation future and stops listening once the future resolves
//! (dropping the receiver stops the background task's sends from
//! blocking, and the task exits on its next tick).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHECKPOINTS: [u8; 5] = [10, 30, 50, 70, 90];

pub struct FallbackProgressScheduler {
    interval: std::time::Duration,
}

impl FallbackProgressScheduler {
    pub fn with_defaults(interval: std::time::Duration) -> Self {
        Self { interval }
    }

    /// Spawns the checkpoint-emitting task and returns the receiving
    /// end. The task exits when `cancel` fires, the channel's sender is
    /// dropped (receiver dropped by the caller), or all checkpoints
    /// have been emitted.
    pub fn spawn(&self, cancel: CancellationToken) -> mpsc::Receiver<u8> {
        let (tx, rx) = mpsc::channel(CHECKPOINTS.len());
        let interval = self.interval;
        tokio::spawn(async move {
            for checkpoint in CHECKPOINTS {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return,
                }
                if tx.send(checkpoint).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_checkpoints_in_ascending_order() {
        let scheduler = FallbackProgressScheduler::with_defaults(std::time::Duration::from_millis(1));
        let mut rx = scheduler.spawn(CancellationToken::new());

        let mut seen = Vec::new();
        while let Some(checkpoint) = rx.recv().await {
            seen.push(checkpoint);
        }
        assert_eq!(seen, CHECKPOINTS.to_vec());
    }

    #[tokio::test]
    async fn stops_emitting_once_cancelled() {
        let cancel = CancellationToken::new();
        let scheduler = FallbackProgressScheduler::with_defaults(std::time::Duration::from_secs(60));
        let mut rx = scheduler.spawn(cancel.clone());
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
