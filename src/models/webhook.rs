use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A queued delivery (spec.md §3 `WebhookDelivery`).
///
/// Deduplicated on `delivery_key` by [`crate::webhook::DeliveryTracker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub delivery_key: String,
    pub webhook_url: String,
    pub payload: Value,
    pub partition_key: String,
    pub attempt_count: u32,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookUrlStats {
    pub delivered: u64,
    pub failed: u64,
    pub last_delivery: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for WebhookUrlStats {
    fn default() -> Self {
        Self {
            delivered: 0,
            failed: 0,
            last_delivery: None,
            last_failure: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}
