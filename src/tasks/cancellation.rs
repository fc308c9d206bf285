use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Keyed cancellation tokens for in-flight tasks (spec.md §4.E
/// `CancellationRegistry`). Tokens are kept for a grace period after
/// cancellation so a task's worker loop has time to observe
/// `is_cancelled()` before the entry is purged.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
    cancelled_at: DashMap<Uuid, Instant>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(task_id, token.clone());
        token
    }

    pub fn cancel(&self, task_id: Uuid) -> bool {
        if let Some(token) = self.tokens.get(&task_id) {
            token.cancel();
            self.cancelled_at.insert(task_id, Instant::now());
            true
        } else {
            false
        }
    }

    pub fn token_for(&self, task_id: Uuid) -> Option<CancellationToken> {
        self.tokens.get(&task_id).map(|t| t.clone())
    }

    pub fn complete(&self, task_id: Uuid) {
        self.tokens.remove(&task_id);
        self.cancelled_at.remove(&task_id);
    }

    /// Drops entries whose cancellation happened more than `grace`
    /// ago, for callers whose worker never checked in.
    pub fn purge_expired(&self, grace: Duration) {
        let now = Instant::now();
        let cutoff = now.checked_sub(grace).unwrap_or(now);
        let stale: Vec<Uuid> = self
            .cancelled_at
            .iter()
            .filter(|e| *e.value() < cutoff)
            .map(|e| *e.key())
            .collect();
        for id in stale {
            self.tokens.remove(&id);
            self.cancelled_at.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_marks_token_and_allows_purge() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id);
        assert!(!token.is_cancelled());

        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        registry.purge_expired(Duration::from_secs(0));
        assert!(registry.token_for(id).is_none());
    }

    #[test]
    fn cancel_unknown_task_is_a_no_op() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }
}
