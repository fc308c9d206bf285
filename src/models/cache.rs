use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CacheRegion {
    VirtualKeys,
    RateLimits,
    ProviderHealth,
    ModelMetadata,
    AuthTokens,
    IpFilters,
    AsyncTasks,
    ProviderResponses,
    Embeddings,
    GlobalSettings,
    Providers,
    ModelCosts,
    AudioStreams,
    Monitoring,
    Default,
}

impl CacheRegion {
    pub const ALL: [CacheRegion; 15] = [
        CacheRegion::VirtualKeys,
        CacheRegion::RateLimits,
        CacheRegion::ProviderHealth,
        CacheRegion::ModelMetadata,
        CacheRegion::AuthTokens,
        CacheRegion::IpFilters,
        CacheRegion::AsyncTasks,
        CacheRegion::ProviderResponses,
        CacheRegion::Embeddings,
        CacheRegion::GlobalSettings,
        CacheRegion::Providers,
        CacheRegion::ModelCosts,
        CacheRegion::AudioStreams,
        CacheRegion::Monitoring,
        CacheRegion::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRegion::VirtualKeys => "virtual-keys",
            CacheRegion::RateLimits => "rate-limits",
            CacheRegion::ProviderHealth => "provider-health",
            CacheRegion::ModelMetadata => "model-metadata",
            CacheRegion::AuthTokens => "auth-tokens",
            CacheRegion::IpFilters => "ip-filters",
            CacheRegion::AsyncTasks => "async-tasks",
            CacheRegion::ProviderResponses => "provider-responses",
            CacheRegion::Embeddings => "embeddings",
            CacheRegion::GlobalSettings => "global-settings",
            CacheRegion::Providers => "providers",
            CacheRegion::ModelCosts => "model-costs",
            CacheRegion::AudioStreams => "audio-streams",
            CacheRegion::Monitoring => "monitoring",
            CacheRegion::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

/// Per-region cache policy (spec.md §3 `CacheRegionConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRegionConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: Option<u64>,
    pub use_memory: bool,
    pub use_distributed: bool,
    pub priority: u8,
    pub eviction_policy: EvictionPolicy,
    pub max_size_bytes: Option<u64>,
    pub detailed_stats: bool,
}

impl CacheRegionConfig {
    /// Region's default tuning, mirroring the compile-time defaults
    /// spec.md §4.B describes, before any config-file overrides.
    pub fn default_for(region: CacheRegion) -> Self {
        let (default_ttl_secs, priority, use_distributed) = match region {
            CacheRegion::VirtualKeys => (300, 90, true),
            CacheRegion::RateLimits => (60, 85, true),
            CacheRegion::ProviderHealth => (30, 80, true),
            CacheRegion::ModelMetadata => (3600, 70, true),
            CacheRegion::AuthTokens => (300, 90, true),
            CacheRegion::IpFilters => (600, 60, false),
            CacheRegion::AsyncTasks => (120, 75, true),
            CacheRegion::ProviderResponses => (600, 40, true),
            CacheRegion::Embeddings => (86_400, 30, true),
            CacheRegion::GlobalSettings => (3600, 65, true),
            CacheRegion::Providers => (3600, 70, true),
            CacheRegion::ModelCosts => (3600, 55, true),
            CacheRegion::AudioStreams => (120, 80, false),
            CacheRegion::Monitoring => (60, 50, true),
            CacheRegion::Default => (300, 50, false),
        };
        Self {
            enabled: true,
            default_ttl_secs,
            max_ttl_secs: None,
            use_memory: true,
            use_distributed,
            priority,
            eviction_policy: EvictionPolicy::Lru,
            max_size_bytes: None,
            detailed_stats: false,
        }
    }

    pub fn effective_ttl_secs(&self, requested: Option<u64>) -> u64 {
        let wanted = requested.unwrap_or(self.default_ttl_secs);
        match self.max_ttl_secs {
            Some(max) => wanted.min(max),
            None => wanted,
        }
    }
}

/// A single stored value plus access bookkeeping (spec.md §3
/// `CacheEntry<T>`). Identity is `(region, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub region: CacheRegion,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    CapacityReached,
    Removed,
    Replaced,
    PolicyTriggered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionEvent {
    pub key: String,
    pub region: CacheRegion,
    pub reason: EvictionReason,
    pub evicted_at: DateTime<Utc>,
}

/// Per-region statistics (spec.md §4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub removes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub average_get_time_micros: f64,
    pub entry_count: u64,
    pub memory_usage_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl CacheStatistics {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hits: 0,
            misses: 0,
            sets: 0,
            removes: 0,
            evictions: 0,
            errors: 0,
            average_get_time_micros: 0.0,
            entry_count: 0,
            memory_usage_bytes: 0,
            start_time: now,
            last_update_time: now,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
