//! Provider Error Tracker (spec.md §4.G).
//!
//! Grounded on `src/llm/router.rs`'s `update_health_failure`
//! consecutive-failure counting, extended into a full per-credential
//! policy table plus bounded recent-history feeds.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::events::{GatewayEvent, GatewayEvents};
use crate::models::provider_errors::{
    default_disable_policy, ErrorAggregate, ProviderCredential, ProviderErrorRecord, ProviderErrorType,
    ProviderSummary,
};

const MAX_RECENT_PER_CREDENTIAL: usize = 100;
const MAX_RECENT_GLOBAL: usize = 1000;

#[derive(Debug, Error)]
pub enum ErrorTrackerError {
    #[error("unknown credential: {0}")]
    UnknownCredential(String),
}

/// Per-`(credential, error_type)` aggregates, bounded recent-history
/// feeds, and credential/provider disable bookkeeping.
pub struct ErrorTracker {
    aggregates: DashMap<(String, ProviderErrorType), ErrorAggregate>,
    recent_per_credential: DashMap<String, VecDeque<ProviderErrorRecord>>,
    recent_global: Mutex<VecDeque<ProviderErrorRecord>>,
    credentials: DashMap<String, ProviderCredential>,
    events: Option<GatewayEvents>,
}

impl ErrorTracker {
    pub fn new(events: Option<GatewayEvents>) -> Self {
        Self {
            aggregates: DashMap::new(),
            recent_per_credential: DashMap::new(),
            recent_global: Mutex::new(VecDeque::new()),
            credentials: DashMap::new(),
            events,
        }
    }

    pub fn register_credential(&self, credential: ProviderCredential) {
        self.credentials.insert(credential.id.clone(), credential);
    }

    /// Records an observed error, updates the aggregate and both
    /// bounded history feeds, and disables the credential (cascading
    /// to the provider if it's the primary) when the disable policy
    /// for its error type fires. Returns `true` when a disable
    /// happened as a result of this record.
    pub async fn record(&self, record: ProviderErrorRecord) -> Result<bool, ErrorTrackerError> {
        self.touch_aggregate(&record);
        self.push_recent(&record).await;

        if !self.credentials.contains_key(&record.credential_id) {
            return Err(ErrorTrackerError::UnknownCredential(record.credential_id));
        }

        if self.should_disable(&record.credential_id, record.error_type) {
            self.disable(&record.credential_id, &format!("{:?} threshold exceeded", record.error_type))
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn touch_aggregate(&self, record: &ProviderErrorRecord) {
        let key = (record.credential_id.clone(), record.error_type);
        let mut aggregate = self.aggregates.entry(key).or_insert_with(|| ErrorAggregate {
            error_type: record.error_type,
            count: 0,
            first_seen: record.occurred_at,
            last_seen: record.occurred_at,
            last_message: record.message.clone(),
            last_status_code: record.http_status_code,
            disabled_at: None,
        });
        aggregate.count += 1;
        aggregate.last_seen = record.occurred_at;
        aggregate.last_message = record.message.clone();
        aggregate.last_status_code = record.http_status_code;
    }

    async fn push_recent(&self, record: &ProviderErrorRecord) {
        let mut per_credential = self.recent_per_credential.entry(record.credential_id.clone()).or_default();
        per_credential.push_back(record.clone());
        while per_credential.len() > MAX_RECENT_PER_CREDENTIAL {
            per_credential.pop_front();
        }
        drop(per_credential);

        let mut global = self.recent_global.lock().await;
        global.push_back(record.clone());
        while global.len() > MAX_RECENT_GLOBAL {
            global.pop_front();
        }
    }

    /// Consults [`default_disable_policy`] plus
    /// [`ProviderErrorType::is_inherently_fatal`]: a fatal error type
    /// disables on its first occurrence, others require
    /// `required_occurrences` within `time_window_secs`.
    pub fn should_disable(&self, credential_id: &str, error_type: ProviderErrorType) -> bool {
        let policy = default_disable_policy(error_type);
        if policy.disable_immediately || error_type.is_inherently_fatal() {
            return true;
        }

        let key = (credential_id.to_string(), error_type);
        let Some(aggregate) = self.aggregates.get(&key) else {
            return false;
        };
        if aggregate.count < policy.required_occurrences as u64 {
            return false;
        }
        let window_start = Utc::now() - chrono::Duration::seconds(policy.time_window_secs as i64);
        aggregate.first_seen >= window_start || policy.time_window_secs == 0
    }

    /// Disables a credential. If it is the provider's primary
    /// credential, every other credential for the same provider is
    /// disabled too, on the assumption that a disabled primary key
    /// signals the provider account itself is unusable.
    pub async fn disable(&self, credential_id: &str, reason: &str) -> Result<(), ErrorTrackerError> {
        let (provider_id, is_primary) = {
            let mut credential = self
                .credentials
                .get_mut(credential_id)
                .ok_or_else(|| ErrorTrackerError::UnknownCredential(credential_id.to_string()))?;
            credential.is_enabled = false;
            (credential.provider_id.clone(), credential.is_primary)
        };

        self.mark_disabled_in_aggregates(credential_id);
        self.publish_disabled(credential_id, &provider_id, reason).await;

        if is_primary {
            let cascaded: Vec<String> = self
                .credentials
                .iter()
                .filter(|e| e.provider_id == provider_id && e.id != credential_id && e.is_enabled)
                .map(|e| e.id.clone())
                .collect();
            for id in cascaded {
                if let Some(mut credential) = self.credentials.get_mut(&id) {
                    credential.is_enabled = false;
                }
                self.mark_disabled_in_aggregates(&id);
                self.publish_disabled(&id, &provider_id, "cascaded from primary credential disable")
                    .await;
            }
        }
        Ok(())
    }

    fn mark_disabled_in_aggregates(&self, credential_id: &str) {
        for mut entry in self.aggregates.iter_mut() {
            if entry.key().0 == credential_id && entry.disabled_at.is_none() {
                entry.disabled_at = Some(Utc::now());
            }
        }
    }

    async fn publish_disabled(&self, credential_id: &str, provider_id: &str, reason: &str) {
        warn!(credential_id, provider_id, reason, "credential disabled");
        if let Some(events) = &self.events {
            events
                .publish(GatewayEvent::CredentialDisabled {
                    key_id: credential_id.to_string(),
                    provider_id: provider_id.to_string(),
                    reason: reason.to_string(),
                    disabled_at: Utc::now(),
                })
                .await;
        }
    }

    pub fn recent_errors(&self, credential_id: &str, limit: usize) -> Vec<ProviderErrorRecord> {
        self.recent_per_credential
            .get(credential_id)
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn recent_global_errors(&self, limit: usize) -> Vec<ProviderErrorRecord> {
        let guard = self.recent_global.lock().await;
        guard.iter().rev().take(limit).cloned().collect()
    }

    pub fn credential_error_counts(&self, credential_id: &str) -> Vec<ErrorAggregate> {
        self.aggregates
            .iter()
            .filter(|e| e.key().0 == credential_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn credential_detail(&self, credential_id: &str) -> Option<ProviderCredential> {
        self.credentials.get(credential_id).map(|c| c.clone())
    }

    pub fn provider_summary(&self, provider_id: &str) -> ProviderSummary {
        let mut total_errors = 0u64;
        let mut fatal_errors = 0u64;
        let mut last_error_at = None;

        let credential_ids: Vec<String> = self
            .credentials
            .iter()
            .filter(|e| e.provider_id == provider_id)
            .map(|e| e.id.clone())
            .collect();

        for entry in self.aggregates.iter() {
            if !credential_ids.contains(&entry.key().0) {
                continue;
            }
            total_errors += entry.count;
            if entry.error_type.is_inherently_fatal() {
                fatal_errors += entry.count;
            }
            last_error_at = Some(last_error_at.map_or(entry.last_seen, |t: DateTime<Utc>| t.max(entry.last_seen)));
        }

        let disabled_credential_ids: Vec<String> = self
            .credentials
            .iter()
            .filter(|e| e.provider_id == provider_id && !e.is_enabled)
            .map(|e| e.id.clone())
            .collect();

        ProviderSummary {
            provider_id: provider_id.to_string(),
            total_errors,
            fatal_errors,
            warnings: total_errors.saturating_sub(fatal_errors),
            disabled_credential_ids,
            last_error_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(credential_id: &str, error_type: ProviderErrorType) -> ProviderErrorRecord {
        ProviderErrorRecord {
            credential_id: credential_id.to_string(),
            provider_id: "openai".to_string(),
            error_type,
            is_fatal: error_type.is_inherently_fatal(),
            http_status_code: Some(401),
            message: "unauthorized".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fatal_error_disables_on_first_occurrence() {
        let tracker = ErrorTracker::new(None);
        tracker.register_credential(ProviderCredential {
            id: "cred-1".into(),
            provider_id: "openai".into(),
            is_primary: false,
            is_enabled: true,
        });

        let disabled = tracker.record(record("cred-1", ProviderErrorType::InvalidApiKey)).await.unwrap();
        assert!(disabled);
        assert!(!tracker.credential_detail("cred-1").unwrap().is_enabled);
    }

    #[tokio::test]
    async fn primary_disable_cascades_to_siblings() {
        let tracker = ErrorTracker::new(None);
        tracker.register_credential(ProviderCredential {
            id: "primary".into(),
            provider_id: "openai".into(),
            is_primary: true,
            is_enabled: true,
        });
        tracker.register_credential(ProviderCredential {
            id: "secondary".into(),
            provider_id: "openai".into(),
            is_primary: false,
            is_enabled: true,
        });

        tracker.disable("primary", "manual").await.unwrap();
        assert!(!tracker.credential_detail("secondary").unwrap().is_enabled);
    }

    #[tokio::test]
    async fn transient_error_requires_threshold_before_disabling() {
        let tracker = ErrorTracker::new(None);
        tracker.register_credential(ProviderCredential {
            id: "cred-1".into(),
            provider_id: "openai".into(),
            is_primary: false,
            is_enabled: true,
        });

        for _ in 0..5 {
            let disabled = tracker.record(record("cred-1", ProviderErrorType::Timeout)).await.unwrap();
            assert!(!disabled);
        }
        assert!(tracker.credential_detail("cred-1").unwrap().is_enabled);
    }
}
