//! Aggregated configuration surface for every component (spec.md §6,
//! "Configuration surface"). Layers a config file over environment
//! variables the way the teacher's `config`/`dotenv` dependencies were
//! declared to be used, following `src/bin/server.rs`'s startup
//! sequence of loading `.env` before building server config.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::cache::CacheRegion;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Router configuration knobs (spec.md §3 `RouterConfig`, minus the
/// deployment/fallback sets which are mutated at runtime via
/// `router::Router::update_router_config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub default_strategy: String,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub unhealthy_after_consecutive_failures: u32,
    pub health_cooldown_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            default_strategy: "simple".to_string(),
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            unhealthy_after_consecutive_failures: 3,
            health_cooldown_secs: 60,
        }
    }
}

/// Webhook batching publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingSettings {
    pub max_batch_size: usize,
    pub max_batch_delay_ms: u64,
    pub concurrent_publishers: usize,
    /// Deliveries failing this many times (circuit-open or notifier
    /// error) are dropped instead of re-enqueued again.
    pub max_delivery_attempts: u32,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay_ms: 100,
            concurrent_publishers: 3,
            max_delivery_attempts: 5,
        }
    }
}

/// Cache monitoring thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    pub min_hit_rate: f64,
    pub max_memory_usage_bytes: u64,
    pub max_eviction_rate: f64,
    pub max_response_time_ms: f64,
    pub min_requests_for_hit_rate_alert: u64,
    pub per_region_max_memory_bytes: HashMap<CacheRegion, u64>,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            min_hit_rate: 0.5,
            max_memory_usage_bytes: 512 * 1024 * 1024,
            max_eviction_rate: 0.2,
            max_response_time_ms: 50.0,
            min_requests_for_hit_rate_alert: 100,
            per_region_max_memory_bytes: HashMap::new(),
        }
    }
}

/// Alerting service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingSettings {
    pub max_history_size: usize,
    pub default_cooldown_secs: u64,
    pub evaluation_interval_secs: u64,
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            max_history_size: 1000,
            default_cooldown_secs: 300,
            evaluation_interval_secs: 60,
        }
    }
}

/// Tracing/span retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingSettings {
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub sampling_rate: f64,
    pub enable_export: bool,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            cleanup_interval_secs: 300,
            sampling_rate: 1.0,
            enable_export: false,
        }
    }
}

/// Realtime audio session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    pub cleanup_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub max_session_age_secs: u64,
    pub zombie_session_threshold_secs: u64,
    pub auto_terminate_zombies: bool,
    pub max_sessions_per_virtual_key: u32,
    pub enable_persistence: bool,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 300,
            metrics_interval_secs: 60,
            max_session_age_secs: 2 * 60 * 60,
            zombie_session_threshold_secs: 15 * 60,
            auto_terminate_zombies: true,
            max_sessions_per_virtual_key: 10,
            enable_persistence: true,
        }
    }
}

/// S3-compatible media store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub access_key: String,
    pub secret_key: String,
    pub bucket_name: String,
    pub service_url: Option<String>,
    pub region: Option<String>,
    pub force_path_style: bool,
    pub is_r2: bool,
    pub multipart_chunk_size_bytes: u64,
    pub multipart_threshold_bytes: u64,
    pub auto_create_bucket: bool,
    pub default_url_expiration_secs: u64,
    pub public_base_url: Option<String>,
    pub auto_configure_cors: bool,
    pub cors_allowed_origins: Vec<String>,
    pub cors_allowed_methods: Vec<String>,
    pub cors_expose_headers: Vec<String>,
    pub cors_max_age_secs: u64,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            bucket_name: "gateway-media".to_string(),
            service_url: None,
            region: Some("us-east-1".to_string()),
            force_path_style: false,
            is_r2: false,
            multipart_chunk_size_bytes: 8 * 1024 * 1024,
            multipart_threshold_bytes: 50 * 1024 * 1024,
            auto_create_bucket: false,
            default_url_expiration_secs: 3600,
            public_base_url: None,
            auto_configure_cors: false,
            cors_allowed_origins: vec!["*".to_string()],
            cors_allowed_methods: vec!["GET".to_string(), "PUT".to_string()],
            cors_expose_headers: vec!["ETag".to_string()],
            cors_max_age_secs: 3600,
        }
    }
}

/// Async task engine retry/backoff constants (Open Question c: these
/// were embedded in the source; here they are configuration fields
/// with the spec's constants as defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEngineSettings {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_jitter: f64,
    pub cancellation_grace_period_secs: u64,
}

impl Default for TaskEngineSettings {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
            retry_jitter: 0.2,
            cancellation_grace_period_secs: 5,
        }
    }
}

/// Top-level aggregated gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    pub router: RouterSettings,
    pub batching: BatchingSettings,
    pub monitoring: MonitoringSettings,
    pub alerting: AlertingSettings,
    pub tracing: TracingSettings,
    pub realtime: RealtimeSettings,
    pub s3: S3Settings,
    pub tasks: TaskEngineSettings,
    pub nats_url: String,
    pub redis_url: String,
    pub database_url: String,
}

impl GatewayConfig {
    /// Load configuration from `config/gateway.toml` (if present),
    /// overlaid with `GATEWAY__*` environment variables, following the
    /// layered-source pattern the `config` crate is built for.
    pub fn load() -> std::result::Result<Self, ConfigLoadError> {
        let _ = dotenv::dotenv();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            );

        let defaults = GatewayConfig::default();
        let builder = builder
            .set_default("nats_url", "nats://localhost:4222")?
            .set_default("redis_url", "redis://localhost:6379")?
            .set_default("database_url", "postgres://localhost/gateway")?
            .set_default("s3.bucket_name", defaults.s3.bucket_name.clone())?;

        let settled = builder.build()?;
        settled
            .try_deserialize()
            .map_err(|e| ConfigLoadError::Invalid(e.to_string()))
    }
}

pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = GatewayConfig::default();
        assert!(cfg.router.max_retries > 0);
        assert!(cfg.tasks.retry_base_delay_secs < cfg.tasks.retry_max_delay_secs);
        assert!(cfg.realtime.zombie_session_threshold_secs < cfg.realtime.max_session_age_secs);
    }
}
