//! Realtime Audio Session Store (spec.md §4.D).
//!
//! Grounded on `src/engine/storage.rs`'s `RwLock<HashMap<...>>` dual-
//! structure bookkeeping idiom, generalized to `DashMap`/`DashSet`
//! since the session store sees far higher write concurrency than the
//! teacher's workflow storage.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::realtime::{RealtimeMetric, RealtimeSession, RealtimeSessionState, SessionStatistics};

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Session store with two atomically-maintained indices: all active
/// session ids, and per-tenant session ids (spec.md §4.D).
pub struct RealtimeSessionStore {
    sessions: DashMap<String, RealtimeSession>,
    active_sessions: DashSet<String>,
    sessions_by_tenant: DashMap<String, DashSet<String>>,
}

impl RealtimeSessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            active_sessions: DashSet::new(),
            sessions_by_tenant: DashMap::new(),
        }
    }

    pub fn store(&self, session: RealtimeSession) {
        let tenant = session.virtual_key().map(str::to_string);
        let id = session.id.clone();
        let is_live = !matches!(session.state, RealtimeSessionState::Closed | RealtimeSessionState::Error);

        self.sessions.insert(id.clone(), session);

        if is_live {
            self.active_sessions.insert(id.clone());
        } else {
            self.active_sessions.remove(&id);
        }

        if let Some(tenant) = tenant {
            self.sessions_by_tenant
                .entry(tenant)
                .or_insert_with(DashSet::new)
                .insert(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<RealtimeSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn update(&self, session: RealtimeSession) {
        self.store(session);
    }

    pub fn remove(&self, id: &str) -> Option<RealtimeSession> {
        let removed = self.sessions.remove(id).map(|(_, v)| v);
        self.active_sessions.remove(id);
        if let Some(session) = &removed {
            if let Some(tenant) = session.virtual_key() {
                if let Some(set) = self.sessions_by_tenant.get(tenant) {
                    set.remove(id);
                }
            }
        }
        removed
    }

    pub fn get_active(&self) -> Vec<RealtimeSession> {
        self.active_sessions
            .iter()
            .filter_map(|id| self.sessions.get(id.key()).map(|s| s.clone()))
            .collect()
    }

    pub fn get_by_tenant(&self, tenant_key: &str) -> Vec<RealtimeSession> {
        self.sessions_by_tenant
            .get(tenant_key)
            .map(|set| {
                set.iter()
                    .filter_map(|id| self.sessions.get(id.key()).map(|s| s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn update_metrics(&self, id: &str, stats: SessionStatistics) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.statistics = stats;
            session.last_activity_at = Utc::now();
        }
    }

    /// Removes sessions older than `max_age` or already `Closed`,
    /// keeping both indices consistent (spec.md §4.D `cleanup`).
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(2));

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.created_at < cutoff || e.state == RealtimeSessionState::Closed)
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }

    /// Marks sessions whose `last_activity_at` is older than
    /// `zombie_threshold` as `Error`, optionally removing them from
    /// both indices, and returns a metric per swept session (spec.md
    /// §4.D `zombieSweep`).
    pub async fn zombie_sweep(&self, zombie_threshold: Duration, auto_terminate: bool) -> Vec<RealtimeMetric> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(zombie_threshold).unwrap_or(chrono::Duration::minutes(15));

        let zombies: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.state == RealtimeSessionState::Active && e.last_activity_at < cutoff)
            .map(|e| e.key().clone())
            .collect();

        let mut metrics = Vec::new();
        for id in zombies {
            let metric = if let Some(mut session) = self.sessions.get_mut(&id) {
                session.state = RealtimeSessionState::Error;
                let duration = (now - session.created_at).num_seconds().max(0) as f64;
                RealtimeMetric {
                    session_id: id.clone(),
                    session_duration_secs: duration,
                    input_duration_secs: session.statistics.input_duration_secs,
                    output_duration_secs: session.statistics.output_duration_secs,
                    turn_count: session.statistics.turn_count,
                    recorded_at: now,
                }
            } else {
                continue;
            };

            if auto_terminate {
                self.remove(&id);
            }
            info!(session_id = %id, "zombie realtime session swept");
            metrics.push(metric);
        }
        metrics
    }

    pub async fn run_lifecycle_loop(
        self: Arc<Self>,
        cleanup_interval: Duration,
        max_age: Duration,
        zombie_threshold: Duration,
        auto_terminate: bool,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup_expired(max_age);
                    self.zombie_sweep(zombie_threshold, auto_terminate).await;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Consistency check: the live `active_sessions` ids exactly match
    /// non-terminal session states (spec.md §8 invariant). Exposed for
    /// tests and health diagnostics, not part of the hot path.
    pub fn active_index_matches_live_sessions(&self) -> bool {
        let live: HashSet<String> = self
            .sessions
            .iter()
            .filter(|e| !matches!(e.state, RealtimeSessionState::Closed | RealtimeSessionState::Error))
            .map(|e| e.key().clone())
            .collect();
        let indexed: HashSet<String> = self.active_sessions.iter().map(|e| e.key().clone()).collect();
        live == indexed
    }
}

impl Default for RealtimeSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn session(id: &str, state: RealtimeSessionState, virtual_key: &str) -> RealtimeSession {
        let mut metadata = HashMap::new();
        metadata.insert("virtualKey".to_string(), virtual_key.to_string());
        RealtimeSession {
            id: id.to_string(),
            provider: "test-provider".to_string(),
            state,
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            statistics: SessionStatistics::default(),
            metadata,
        }
    }

    #[test]
    fn tenant_index_tracks_membership() {
        let store = RealtimeSessionStore::new();
        store.store(session("s1", RealtimeSessionState::Active, "vkey-1"));
        store.store(session("s2", RealtimeSessionState::Active, "vkey-1"));

        assert_eq!(store.get_by_tenant("vkey-1").len(), 2);
        store.remove("s1");
        assert_eq!(store.get_by_tenant("vkey-1").len(), 1);
        assert!(store.active_index_matches_live_sessions());
    }

    #[tokio::test]
    async fn zombie_sweep_marks_and_removes_stale_sessions() {
        let store = RealtimeSessionStore::new();
        let mut zombie = session("s1", RealtimeSessionState::Active, "vkey-1");
        zombie.last_activity_at = Utc::now() - chrono::Duration::minutes(16);
        store.store(zombie);

        let metrics = store.zombie_sweep(Duration::from_secs(15 * 60), true).await;
        assert_eq!(metrics.len(), 1);
        assert!(store.get("s1").is_none());
    }
}
