use std::collections::HashMap;

use crate::models::cache::{CacheRegion, CacheRegionConfig};

/// Registry of per-region policy, seeded with compile-time defaults
/// and overridable from [`crate::config::GatewayConfig`] (spec.md
/// §4.B "Regions are enumerated ... overridable via config").
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    configs: HashMap<CacheRegion, CacheRegionConfig>,
}

impl RegionRegistry {
    pub fn with_defaults() -> Self {
        let configs = CacheRegion::ALL
            .into_iter()
            .map(|r| (r, CacheRegionConfig::default_for(r)))
            .collect();
        Self { configs }
    }

    /// Unknown regions fall back to the Default region config (spec.md
    /// §4.B); since `CacheRegion` is a closed enum here every variant
    /// has an entry, so this only exercises the fallback path if a
    /// config override removes one.
    pub fn get(&self, region: CacheRegion) -> CacheRegionConfig {
        self.configs
            .get(&region)
            .cloned()
            .unwrap_or_else(|| self.configs[&CacheRegion::Default].clone())
    }

    pub fn set(&mut self, region: CacheRegion, config: CacheRegionConfig) {
        self.configs.insert(region, config);
    }

    pub fn apply_overrides(&mut self, overrides: HashMap<CacheRegion, CacheRegionConfig>) {
        for (region, config) in overrides {
            self.configs.insert(region, config);
        }
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
