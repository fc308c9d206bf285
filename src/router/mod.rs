//! Model Router & Fallback Engine (spec.md §4.F).
//!
//! Grounded directly on `src/llm/router.rs`'s `LLMRouter`: the
//! `DeploymentHealth` struct mirrors `ProviderHealthStatus`
//! (consecutive-failure counter, cooldown re-admission), and
//! `Router::chat_completion`'s retry loop is the same
//! `retry_count <= max_retries` shape with the per-attempt sleep
//! generalized to the jittered backoff used by the task engine.

pub(crate) mod selection;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RouterSettings;
use crate::models::router::{ModelDeployment, RouterConfig, RoutingStrategy};
use crate::providers::{ProviderError, ProviderRegistry};

pub use selection::select_deployment;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no deployment found for model '{0}'")]
    NoDeployment(String),
    #[error("all deployments for model '{0}' are unhealthy")]
    AllUnhealthy(String),
    #[error("fallback chain for '{0}' contains a cycle")]
    FallbackCycle(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DeploymentHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub unhealthy_since: Option<DateTime<Utc>>,
}

impl Default for DeploymentHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            last_error: None,
            unhealthy_since: None,
        }
    }
}

pub struct Router {
    config: tokio::sync::RwLock<RouterConfig>,
    settings: RouterSettings,
    health: DashMap<String, DeploymentHealth>,
    round_robin_counters: DashMap<String, u64>,
    providers: Arc<ProviderRegistry>,
}

impl Router {
    pub fn new(config: RouterConfig, settings: RouterSettings, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            config: tokio::sync::RwLock::new(config),
            settings,
            health: DashMap::new(),
            round_robin_counters: DashMap::new(),
            providers,
        }
    }

    /// Replaces the routing configuration, rejecting it wholesale if
    /// any fallback chain contains a cycle (spec.md §3 `RouterConfig`
    /// invariant).
    pub async fn update_config(&self, config: RouterConfig) -> Result<(), RouterError> {
        for start in config.fallbacks.keys() {
            if config.has_cycle_from(start) {
                return Err(RouterError::FallbackCycle(start.clone()));
            }
        }
        *self.config.write().await = config;
        Ok(())
    }

    pub async fn config_snapshot(&self) -> RouterConfig {
        self.config.read().await.clone()
    }

    fn is_healthy(&self, deployment_name: &str) -> bool {
        match self.health.get(deployment_name) {
            None => true,
            Some(health) => {
                if health.is_healthy {
                    return true;
                }
                // Cooldown re-admission: treat as healthy again once
                // the cooldown has elapsed, same as
                // `ProviderHealthStatus` consecutive-failure reset.
                health
                    .unhealthy_since
                    .map(|since| (Utc::now() - since).num_seconds() as u64 >= self.settings.health_cooldown_secs)
                    .unwrap_or(true)
            }
        }
    }

    fn record_success(&self, deployment_name: &str) {
        self.health.insert(
            deployment_name.to_string(),
            DeploymentHealth {
                is_healthy: true,
                consecutive_failures: 0,
                last_error: None,
                unhealthy_since: None,
            },
        );
    }

    fn record_failure(&self, deployment_name: &str, error: &str) {
        let mut entry = self.health.entry(deployment_name.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());
        if entry.consecutive_failures >= self.settings.unhealthy_after_consecutive_failures {
            if entry.is_healthy {
                entry.unhealthy_since = Some(Utc::now());
            }
            entry.is_healthy = false;
        }
    }

    fn next_round_robin_index(&self, model_alias: &str, len: usize) -> usize {
        let mut counter = self.round_robin_counters.entry(model_alias.to_string()).or_insert(0);
        let index = (*counter as usize) % len;
        *counter = counter.wrapping_add(1);
        index
    }

    /// Builds the ordered candidate list for `model_alias`: the
    /// strategy-selected healthy deployment first, then its configured
    /// fallbacks in order, each fallback itself strategy-resolved.
    async fn candidate_chain(&self, model_alias: &str, strategy: RoutingStrategy) -> Result<Vec<ModelDeployment>, RouterError> {
        let config = self.config.read().await;
        let mut chain_names = vec![model_alias.to_lowercase()];
        if let Some(fallbacks) = config.fallbacks.get(&model_alias.to_lowercase()) {
            chain_names.extend(fallbacks.iter().map(|f| f.to_lowercase()));
        }

        let mut candidates = Vec::new();
        for name in chain_names {
            let healthy_deployments: Vec<ModelDeployment> = config
                .deployments
                .iter()
                .filter(|d| d.name_key() == name && self.is_healthy(&d.name))
                .cloned()
                .collect();
            if healthy_deployments.is_empty() {
                continue;
            }
            let chosen = match selection::select_deployment(&healthy_deployments, strategy, |len| {
                self.next_round_robin_index(&name, len)
            }) {
                Some(d) => d,
                None => continue,
            };
            candidates.push(chosen);
        }
        Ok(candidates)
    }

    /// Routes a chat completion through the fallback chain, retrying
    /// each candidate with jittered exponential backoff before moving
    /// to the next, per spec.md §4.F.
    pub async fn chat_completion(
        &self,
        model_alias: &str,
        request: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, RouterError> {
        let strategy = self.config.read().await.default_strategy;
        let candidates = self.candidate_chain(model_alias, strategy).await?;
        if candidates.is_empty() {
            return Err(RouterError::AllUnhealthy(model_alias.to_string()));
        }

        let mut last_err = None;
        for deployment in candidates {
            match self.invoke_with_retry(&deployment, request.clone(), cancel).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(deployment = %deployment.name, %err, "deployment exhausted retries, trying fallback");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RouterError::NoDeployment(model_alias.to_string())))
    }

    async fn invoke_with_retry(
        &self,
        deployment: &ModelDeployment,
        request: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, RouterError> {
        let max_retries = self.settings.max_retries;
        let mut retry_count = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }

            let chat = self.providers.chat_provider(&deployment.provider_id)?;
            match chat.chat_completion(&deployment.provider_model_id, request.clone()).await {
                Ok(response) => {
                    self.record_success(&deployment.name);
                    return Ok(response);
                }
                Err(err) => {
                    self.record_failure(&deployment.name, &err.to_string());
                    if !err.is_retryable() || retry_count >= max_retries {
                        return Err(RouterError::Provider(err));
                    }
                    retry_count += 1;
                    let delay = backoff_delay(&self.settings, retry_count);
                    debug!(deployment = %deployment.name, retry_count, ?delay, "retrying after provider error");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                    }
                }
            }
        }
    }
}

/// `min(maxDelay, base * 2^retryCount)` with up to 20% jitter, matching
/// the jittered-backoff idiom used by [`crate::tasks::next_retry_delay`].
fn backoff_delay(settings: &RouterSettings, retry_count: u32) -> Duration {
    let base = settings.retry_base_delay_ms as f64;
    let max = settings.retry_max_delay_ms as f64;
    let exp = base * 2f64.powi(retry_count as i32 - 1);
    let capped = exp.min(max);
    let jitter = rand::thread_rng().gen_range(0.0..=0.2);
    Duration::from_millis((capped * (1.0 + jitter)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyChat {
        failures_before_success: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl crate::providers::ChatCompletion for FlakyChat {
        async fn chat_completion(&self, _model: &str, request: Value) -> Result<Value, ProviderError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures_before_success {
                Err(ProviderError::Transient("timeout".into()))
            } else {
                Ok(request)
            }
        }
    }

    fn deployment(name: &str, provider_id: &str) -> ModelDeployment {
        ModelDeployment {
            name: name.to_string(),
            provider_id: provider_id.to_string(),
            provider_model_id: "model-x".to_string(),
            priority: 0,
            weight: 1,
            healthy: true,
            last_error: None,
        }
    }

    fn router_with(deployments: Vec<ModelDeployment>, providers: ProviderRegistry) -> Router {
        let mut config = RouterConfig::default();
        config.deployments = deployments;
        Router::new(config, RouterSettings::default(), Arc::new(providers))
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::providers::ProviderHandle::new("p1").with_chat(Arc::new(FlakyChat {
                failures_before_success: 2,
                attempts: AtomicU32::new(0),
            })),
        );
        let router = router_with(vec![deployment("gpt-x", "p1")], providers);

        let cancel = CancellationToken::new();
        let result = router.chat_completion("gpt-x", serde_json::json!({"x": 1}), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_next_deployment_on_exhausted_retries() {
        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::providers::ProviderHandle::new("bad").with_chat(Arc::new(FlakyChat {
                failures_before_success: 100,
                attempts: AtomicU32::new(0),
            })),
        );
        providers.register(
            crate::providers::ProviderHandle::new("good").with_chat(Arc::new(FlakyChat {
                failures_before_success: 0,
                attempts: AtomicU32::new(0),
            })),
        );

        let mut config = RouterConfig::default();
        config.deployments = vec![deployment("primary", "bad"), deployment("backup", "good")];
        config.fallbacks.insert("primary".to_string(), vec!["backup".to_string()]);
        let router = Router::new(config, RouterSettings { max_retries: 1, retry_base_delay_ms: 1, retry_max_delay_ms: 2, ..RouterSettings::default() }, Arc::new(providers));

        let cancel = CancellationToken::new();
        let result = router.chat_completion("primary", serde_json::json!({}), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cyclic_fallback_config_is_rejected() {
        let router = router_with(vec![], ProviderRegistry::new());
        let mut config = RouterConfig::default();
        config.fallbacks.insert("a".to_string(), vec!["b".to_string()]);
        config.fallbacks.insert("b".to_string(), vec!["a".to_string()]);
        assert!(router.update_config(config).await.is_err());
    }
}
