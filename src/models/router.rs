use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// A single routable backend for a model alias (spec.md §3).
///
/// Identity is `name`, compared case-insensitively by callers via
/// [`ModelDeployment::name_key`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDeployment {
    pub name: String,
    pub provider_id: String,
    pub provider_model_id: String,
    pub priority: u32,
    pub weight: u32,
    pub healthy: bool,
    pub last_error: Option<String>,
}

impl ModelDeployment {
    pub fn name_key(&self) -> String {
        self.name.to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    Simple,
    RoundRobin,
    LeastCost,
    LeastLatency,
    Random,
}

/// Router configuration (spec.md §3 `RouterConfig`).
///
/// Invariant enforced by [`crate::router::Router::update_config`]: every
/// name appearing in a `fallbacks` value must resolve to a deployment
/// name or alias, and the fallback relation must be acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub default_strategy: RoutingStrategy,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub deployments: Vec<ModelDeployment>,
    pub fallbacks: HashMap<String, Vec<String>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::Simple,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            deployments: Vec::new(),
            fallbacks: HashMap::new(),
        }
    }
}

impl RouterConfig {
    /// Detects a cycle in the fallback relation starting from `start`,
    /// treating each key's value list as outgoing edges.
    pub fn has_cycle_from(&self, start: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start.to_lowercase()];
        let mut path = HashSet::new();
        path.insert(start.to_lowercase());

        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(children) = self.fallbacks.get(&node) {
                for child in children {
                    let child_key = child.to_lowercase();
                    if child_key == start.to_lowercase() {
                        return true;
                    }
                    stack.push(child_key);
                }
            }
        }
        false
    }
}
