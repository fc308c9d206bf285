//! Per-URL circuit breaker (spec.md §4.J).
//!
//! Named for the crate's own domain: a Closed/Open/HalfOpen state
//! machine per destination URL, generalized from the consecutive-
//! failure counting `src/llm/router.rs`'s `update_health_failure`
//! already does for provider health, with an explicit HalfOpen probe
//! state the provider-health tracker doesn't need.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::DistributedTier;
use crate::models::cache::CacheRegion;
use crate::models::webhook::CircuitState;

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_DURATION: Duration = Duration::from_secs(5 * 60);
const COUNTER_RESET_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<chrono::DateTime<Utc>>,
    last_failure_at: Option<chrono::DateTime<Utc>>,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_at: None,
        }
    }
}

/// Per-URL circuit breaker. State is kept in-memory and, when a
/// [`DistributedTier`] is configured, mirrored under `CacheRegion::Default`
/// (the catch-all region) so multiple gateway instances converge on the
/// same open/closed view of a flaky destination.
pub struct WebhookCircuitBreaker {
    entries: DashMap<String, CircuitEntry>,
    distributed: Option<Arc<DistributedTier>>,
}

impl WebhookCircuitBreaker {
    pub fn new(distributed: Option<Arc<DistributedTier>>) -> Self {
        Self {
            entries: DashMap::new(),
            distributed,
        }
    }

    fn distributed_key(url: &str) -> String {
        format!("webhook-circuit:{url}")
    }

    /// Whether a delivery to `url` should be attempted right now.
    /// HalfOpen is entered (and reported as "allowed") once
    /// `OPEN_DURATION` has elapsed since the circuit opened; the next
    /// `record_failure`/`record_success` call resolves it back to Open
    /// or Closed.
    pub fn allow(&self, url: &str) -> bool {
        let mut entry = self.entries.entry(url.to_string()).or_default();
        self.reset_counter_if_stale(&mut entry);

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|at| Utc::now() - at).unwrap_or_default();
                if elapsed >= chrono::Duration::from_std(OPEN_DURATION).unwrap_or_default() {
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn reset_counter_if_stale(&self, entry: &mut CircuitEntry) {
        if entry.state != CircuitState::Closed {
            return;
        }
        if let Some(last_failure) = entry.last_failure_at {
            if Utc::now() - last_failure >= chrono::Duration::from_std(COUNTER_RESET_DURATION).unwrap_or_default() {
                entry.consecutive_failures = 0;
                entry.last_failure_at = None;
            }
        }
    }

    pub async fn record_success(&self, url: &str) {
        let mut entry = self.entries.entry(url.to_string()).or_default();
        *entry = CircuitEntry::default();
        drop(entry);
        self.persist(url).await;
    }

    pub async fn record_failure(&self, url: &str) {
        {
            let mut entry = self.entries.entry(url.to_string()).or_default();
            entry.consecutive_failures += 1;
            entry.last_failure_at = Some(Utc::now());
            if entry.state == CircuitState::HalfOpen || entry.consecutive_failures >= FAILURE_THRESHOLD {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Utc::now());
            }
        }
        self.persist(url).await;
    }

    pub fn state(&self, url: &str) -> CircuitState {
        self.entries.get(url).map(|e| e.state).unwrap_or(CircuitState::Closed)
    }

    async fn persist(&self, url: &str) {
        let Some(distributed) = &self.distributed else { return };
        let Some(entry) = self.entries.get(url) else { return };
        if let Ok(value) = serde_json::to_value(&*entry) {
            let _ = distributed.set(CacheRegion::Default, &Self::distributed_key(url), &value, COUNTER_RESET_DURATION.as_secs()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = WebhookCircuitBreaker::new(None);
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure("https://example.com/hook").await;
        }
        assert_eq!(breaker.state("https://example.com/hook"), CircuitState::Open);
        assert!(!breaker.allow("https://example.com/hook"));
    }

    #[tokio::test]
    async fn success_resets_to_closed() {
        let breaker = WebhookCircuitBreaker::new(None);
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure("https://example.com/hook").await;
        }
        breaker.record_success("https://example.com/hook").await;
        assert_eq!(breaker.state("https://example.com/hook"), CircuitState::Closed);
        assert!(breaker.allow("https://example.com/hook"));
    }
}
