//! Delivery dedup and per-URL statistics (spec.md §4.J).
//!
//! Dedup entries expire after 24h, per-URL stats after 30d; both are
//! swept lazily on access rather than via a background timer, mirroring
//! `src/realtime/mod.rs`'s `cleanup_expired` sweep style but triggered
//! per-call since delivery volume is bursty rather than steady.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::models::webhook::WebhookUrlStats;

const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const STATS_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct DeliveryTracker {
    seen: DashMap<String, chrono::DateTime<Utc>>,
    url_stats: DashMap<String, (WebhookUrlStats, chrono::DateTime<Utc>)>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            seen: DashMap::new(),
            url_stats: DashMap::new(),
        }
    }

    /// Returns `true` the first time `delivery_key` is seen within the
    /// dedup window, `false` on a repeat (spec.md §4.J "at-least-once
    /// delivery, deduplicated at the consumer").
    pub fn mark_seen(&self, delivery_key: &str) -> bool {
        let now = Utc::now();
        if let Some(seen_at) = self.seen.get(delivery_key) {
            if now - *seen_at < chrono::Duration::from_std(DEDUP_TTL).unwrap_or_default() {
                return false;
            }
        }
        self.seen.insert(delivery_key.to_string(), now);
        true
    }

    pub fn record_delivered(&self, url: &str) {
        let now = Utc::now();
        let mut entry = self.url_stats.entry(url.to_string()).or_insert_with(|| (WebhookUrlStats::default(), now));
        entry.0.delivered += 1;
        entry.0.last_delivery = Some(now);
        entry.1 = now;
    }

    pub fn record_failed(&self, url: &str, error: &str) {
        let now = Utc::now();
        let mut entry = self.url_stats.entry(url.to_string()).or_insert_with(|| (WebhookUrlStats::default(), now));
        entry.0.failed += 1;
        entry.0.last_failure = Some(now);
        entry.0.last_error = Some(error.to_string());
        entry.1 = now;
    }

    pub fn stats_for(&self, url: &str) -> Option<WebhookUrlStats> {
        self.url_stats.get(url).map(|e| e.0.clone())
    }

    /// Drops dedup keys and per-URL stats past their respective TTLs.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.seen.retain(|_, seen_at| now - *seen_at < chrono::Duration::from_std(DEDUP_TTL).unwrap_or_default());
        self.url_stats
            .retain(|_, (_, last_touched)| now - *last_touched < chrono::Duration::from_std(STATS_TTL).unwrap_or_default());
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_seen_dedups_within_window() {
        let tracker = DeliveryTracker::new();
        assert!(tracker.mark_seen("key-1"));
        assert!(!tracker.mark_seen("key-1"));
    }

    #[test]
    fn stats_accumulate_per_url() {
        let tracker = DeliveryTracker::new();
        tracker.record_delivered("https://example.com/hook");
        tracker.record_delivered("https://example.com/hook");
        tracker.record_failed("https://example.com/hook", "timeout");

        let stats = tracker.stats_for("https://example.com/hook").unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }
}
