//! Monitoring & Alerting (spec.md §4.I).
//!
//! `CacheMonitor` runs every minute evaluating [`MonitoringSettings`]
//! thresholds against [`CacheManager`] statistics; `AudioAlertEngine`
//! evaluates [`AlertRule`]s against an [`AudioMetricsSnapshot`] with
//! per-rule cooldown suppression. Both funnel into [`AlertNotifier`]
//! implementors for delivery. Grounded on `src/llm/router.rs`'s
//! periodic health-check loop, generalized from provider health into a
//! first-class threshold evaluator over arbitrary metric snapshots.

mod notifier;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::config::{AlertingSettings, MonitoringSettings};
use crate::events::{GatewayEvent, GatewayEvents};
use crate::models::cache::CacheRegion;
use crate::models::monitoring::{AlertRule, AlertState, AudioMetricsSnapshot, TriggeredAlert};

pub use notifier::{AlertNotifier, EmailNotifier, MailTransport, SlackNotifier, TeamsNotifier, WebhookNotifier};

/// Polls [`CacheManager::statistics`] for every region once per tick
/// and publishes a `CacheAlertTriggered` event for each breached
/// threshold in [`MonitoringSettings`] (spec.md §4.I "cache health
/// checks").
pub struct CacheMonitor {
    cache: Arc<CacheManager>,
    settings: MonitoringSettings,
    events: Option<GatewayEvents>,
}

impl CacheMonitor {
    pub fn new(cache: Arc<CacheManager>, settings: MonitoringSettings, events: Option<GatewayEvents>) -> Self {
        Self { cache, settings, events }
    }

    /// Evaluates every region once; returns the breaches found, for
    /// tests and for the caller to fold into its own bookkeeping.
    pub async fn evaluate_once(&self) -> Vec<(CacheRegion, &'static str, f64, f64)> {
        let mut breaches = Vec::new();
        for region in CacheRegion::ALL {
            let stats = self.cache.statistics(region);
            let total_requests = stats.hits + stats.misses;

            if total_requests >= self.settings.min_requests_for_hit_rate_alert && stats.hit_rate() < self.settings.min_hit_rate {
                breaches.push((region, "hit_rate", stats.hit_rate(), self.settings.min_hit_rate));
            }
            if stats.memory_usage_bytes as f64 > self.settings.max_memory_usage_bytes as f64 {
                breaches.push((
                    region,
                    "memory_usage_bytes",
                    stats.memory_usage_bytes as f64,
                    self.settings.max_memory_usage_bytes as f64,
                ));
            }
            if let Some(max_bytes) = self.settings.per_region_max_memory_bytes.get(&region) {
                if stats.memory_usage_bytes > *max_bytes {
                    breaches.push((region, "per_region_memory_usage_bytes", stats.memory_usage_bytes as f64, *max_bytes as f64));
                }
            }
            if total_requests > 0 {
                let eviction_rate = stats.evictions as f64 / total_requests as f64;
                if eviction_rate > self.settings.max_eviction_rate {
                    breaches.push((region, "eviction_rate", eviction_rate, self.settings.max_eviction_rate));
                }
            }
            if stats.average_get_time_micros / 1000.0 > self.settings.max_response_time_ms {
                breaches.push((
                    region,
                    "average_response_time_ms",
                    stats.average_get_time_micros / 1000.0,
                    self.settings.max_response_time_ms,
                ));
            }
        }

        for (region, metric, value, threshold) in &breaches {
            self.publish_breach(*region, metric, *value, *threshold).await;
        }
        breaches
    }

    async fn publish_breach(&self, region: CacheRegion, metric: &str, value: f64, threshold: f64) {
        warn!(region = region.as_str(), metric, value, threshold, "cache health threshold breached");
        if let Some(events) = &self.events {
            events
                .publish(GatewayEvent::CacheAlertTriggered {
                    region: region.as_str().to_string(),
                    metric: metric.to_string(),
                    value,
                    threshold,
                    triggered_at: Utc::now(),
                })
                .await;
        }
    }

    pub async fn run_loop(&self, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.evaluate_once().await; }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

/// Evaluates [`AlertRule`]s against an [`AudioMetricsSnapshot`],
/// suppressing re-firing within each rule's cooldown window (spec.md
/// §4.I "Audio alert engine").
pub struct AudioAlertEngine {
    rules: DashMap<String, AlertRule>,
    last_triggered: DashMap<String, chrono::DateTime<Utc>>,
    history: tokio::sync::Mutex<Vec<TriggeredAlert>>,
    settings: AlertingSettings,
    notifiers: HashMap<crate::models::monitoring::AlertChannelType, Arc<dyn AlertNotifier>>,
}

impl AudioAlertEngine {
    pub fn new(settings: AlertingSettings) -> Self {
        Self {
            rules: DashMap::new(),
            last_triggered: DashMap::new(),
            history: tokio::sync::Mutex::new(Vec::new()),
            settings,
            notifiers: HashMap::new(),
        }
    }

    pub fn register_notifier(&mut self, channel: crate::models::monitoring::AlertChannelType, notifier: Arc<dyn AlertNotifier>) {
        self.notifiers.insert(channel, notifier);
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) {
        self.rules.remove(rule_id);
    }

    /// Reads the metric named by `rule.metric_type` off the snapshot,
    /// evaluates the rule's comparator, and fires through every
    /// configured channel when the condition holds and the rule is not
    /// within its cooldown.
    pub async fn evaluate(&self, snapshot: &AudioMetricsSnapshot) -> Vec<TriggeredAlert> {
        let mut fired = Vec::new();
        for entry in self.rules.iter() {
            let rule = entry.value();
            if !rule.is_enabled {
                continue;
            }
            let Some(metric_value) = read_metric(snapshot, &rule.metric_type) else {
                continue;
            };
            if !rule.condition.operator.evaluate(metric_value, rule.condition.threshold) {
                continue;
            }
            if self.within_cooldown(rule) {
                debug!(rule_id = %rule.id, "alert suppressed by cooldown");
                continue;
            }

            let alert = TriggeredAlert {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                metric_value,
                message: format!("{} breached threshold ({} {:?} {})", rule.name, metric_value, rule.condition.operator, rule.condition.threshold),
                details: serde_json::to_value(snapshot).unwrap_or_default(),
                triggered_at: snapshot.captured_at,
                state: AlertState::Active,
                acknowledged_by: None,
                acknowledged_at: None,
                ack_notes: None,
            };

            self.last_triggered.insert(rule.id.clone(), snapshot.captured_at);
            self.record_history(alert.clone()).await;
            self.notify(rule, &alert).await;
            fired.push(alert);
        }
        fired
    }

    fn within_cooldown(&self, rule: &AlertRule) -> bool {
        self.last_triggered
            .get(&rule.id)
            .map(|last| (Utc::now() - *last).num_seconds() < rule.cooldown_secs as i64)
            .unwrap_or(false)
    }

    async fn record_history(&self, alert: TriggeredAlert) {
        let mut history = self.history.lock().await;
        history.push(alert);
        while history.len() > self.settings.max_history_size {
            history.remove(0);
        }
    }

    async fn notify(&self, rule: &AlertRule, alert: &TriggeredAlert) {
        for channel in &rule.channels {
            if let Some(notifier) = self.notifiers.get(&channel.channel_type) {
                if let Err(err) = notifier.notify(&channel.target, alert).await {
                    warn!(%err, channel = ?channel.channel_type, "alert notification failed");
                }
            }
        }
    }

    pub async fn history(&self) -> Vec<TriggeredAlert> {
        self.history.lock().await.clone()
    }

    pub async fn run_loop(&self, snapshots: tokio::sync::mpsc::Receiver<AudioMetricsSnapshot>, cancel: CancellationToken) {
        let mut snapshots = snapshots;
        loop {
            tokio::select! {
                Some(snapshot) = snapshots.recv() => { self.evaluate(&snapshot).await; }
                _ = cancel.cancelled() => break,
                else => break,
            }
        }
    }
}

fn read_metric(snapshot: &AudioMetricsSnapshot, metric_type: &str) -> Option<f64> {
    match metric_type {
        "error_rate" => Some(snapshot.error_rate),
        "provider_availability" => Some(snapshot.provider_availability),
        "active_sessions" => Some(snapshot.active_sessions as f64),
        "request_rate" => Some(snapshot.request_rate),
        "connection_pool_utilization" => Some(snapshot.connection_pool_utilization),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cache::CacheRegionConfig;
    use crate::models::monitoring::{AlertChannel, AlertChannelType, AlertCondition, Comparator};

    #[tokio::test]
    async fn cache_monitor_flags_low_hit_rate() {
        let cache = Arc::new(CacheManager::new(None, None));
        cache.configure_region(CacheRegion::Default, CacheRegionConfig::default_for(CacheRegion::Default)).await;
        for _ in 0..200 {
            let _: Option<String> = cache.get("missing", CacheRegion::Default).await.unwrap();
        }

        let monitor = CacheMonitor::new(cache, MonitoringSettings { min_requests_for_hit_rate_alert: 100, ..MonitoringSettings::default() }, None);
        let breaches = monitor.evaluate_once().await;
        assert!(breaches.iter().any(|(region, metric, ..)| *region == CacheRegion::Default && *metric == "hit_rate"));
    }

    #[tokio::test]
    async fn audio_alert_engine_suppresses_within_cooldown() {
        let engine = AudioAlertEngine::new(AlertingSettings::default());
        engine.add_rule(AlertRule {
            id: "err-rate".into(),
            name: "error rate high".into(),
            metric_type: "error_rate".into(),
            condition: AlertCondition { operator: Comparator::Gt, threshold: 0.1, time_window_secs: 60, min_occurrences: 1 },
            severity: crate::models::monitoring::AlertSeverity::Critical,
            is_enabled: true,
            cooldown_secs: 300,
            channels: vec![AlertChannel { channel_type: AlertChannelType::Webhook, target: "https://example.com/hook".into() }],
        });

        let snapshot = AudioMetricsSnapshot {
            error_rate: 0.5,
            provider_availability: 1.0,
            active_sessions: 10,
            request_rate: 5.0,
            connection_pool_utilization: 0.2,
            captured_at: Utc::now(),
        };

        let first = engine.evaluate(&snapshot).await;
        assert_eq!(first.len(), 1);
        let second = engine.evaluate(&snapshot).await;
        assert!(second.is_empty());
    }
}
