use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum RealtimeSessionState {
    Connecting,
    Active,
    Closing,
    Closed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStatistics {
    pub input_duration_secs: f64,
    pub output_duration_secs: f64,
    pub turn_count: u64,
    pub error_count: u64,
    pub duration_secs: f64,
}

/// A live or recently-live audio session (spec.md §3 `RealtimeSession`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSession {
    pub id: String,
    pub provider: String,
    pub state: RealtimeSessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub statistics: SessionStatistics,
    pub metadata: HashMap<String, String>,
}

impl RealtimeSession {
    pub fn virtual_key(&self) -> Option<&str> {
        self.metadata.get("virtualKey").map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMetric {
    pub session_id: String,
    pub session_duration_secs: f64,
    pub input_duration_secs: f64,
    pub output_duration_secs: f64,
    pub turn_count: u64,
    pub recorded_at: DateTime<Utc>,
}
