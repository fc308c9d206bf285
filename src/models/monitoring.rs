use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Eq,
    Neq,
    Gte,
    Lte,
}

impl Comparator {
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Neq => (value - threshold).abs() >= f64::EPSILON,
            Comparator::Gte => value >= threshold,
            Comparator::Lte => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AlertChannelType {
    Email,
    Webhook,
    Slack,
    Teams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub channel_type: AlertChannelType,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCondition {
    pub operator: Comparator,
    pub threshold: f64,
    pub time_window_secs: u64,
    pub min_occurrences: u32,
}

/// A configured alert definition (spec.md §3 `AlertRule`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub metric_type: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub is_enabled: bool,
    pub cooldown_secs: u64,
    pub channels: Vec<AlertChannel>,
}

impl AlertRule {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertState {
    Active,
    Acknowledged,
    Resolved,
}

/// A fired alert instance (spec.md §3 `TriggeredAlert`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredAlert {
    pub id: String,
    pub rule_id: String,
    pub metric_value: f64,
    pub message: String,
    pub details: Value,
    pub triggered_at: DateTime<Utc>,
    pub state: AlertState,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub ack_notes: Option<String>,
}

/// Snapshot fed into the audio alert evaluator (spec.md §4.I).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMetricsSnapshot {
    pub error_rate: f64,
    pub provider_availability: f64,
    pub active_sessions: u64,
    pub request_rate: f64,
    pub connection_pool_utilization: f64,
    pub captured_at: DateTime<Utc>,
}

/// Cache-health alert payload emitted on threshold breach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheAlertTriggered {
    pub region: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
}
