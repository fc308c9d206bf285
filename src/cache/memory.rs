use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::models::cache::{CacheEntry, CacheRegion, CacheRegionConfig, EvictionReason};

fn entry_key(region: CacheRegion, key: &str) -> String {
    format!("{}:{}", region.as_str(), key)
}

fn estimate_size(key: &str, value: &Value) -> u64 {
    let payload = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
    (payload + key.len()) as u64
}

/// How aggressively a region reclaims space once over `max_size_bytes`,
/// derived from its priority (spec.md §4.B "LRU by priority class
/// derived from region priority: ≥80 high, ≥50 normal, else low").
/// Low-priority regions reclaim past the bare minimum so they leave
/// more headroom before the next write trips capacity again; high
/// priority regions reclaim just enough to get back under budget.
fn target_load_factor(priority: u8) -> f64 {
    if priority >= 80 {
        0.95
    } else if priority >= 50 {
        0.90
    } else {
        0.80
    }
}

/// In-process tier: a flat `DashMap` keyed by `region:key`, holding
/// values pre-serialized to `serde_json::Value` so the map itself does
/// not need to be generic over every type the cache ever stores.
pub struct MemoryTier {
    entries: DashMap<String, CacheEntry<Value>>,
    region_bytes: DashMap<CacheRegion, u64>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            region_bytes: DashMap::new(),
        }
    }

    pub fn get(&self, region: CacheRegion, key: &str) -> Option<Value> {
        let map_key = entry_key(region, key);
        let now = Utc::now();
        let mut entry = self.entries.get_mut(&map_key)?;
        if entry.is_expired(now) {
            let size = estimate_size(&entry.key, &entry.value);
            drop(entry);
            self.entries.remove(&map_key);
            self.debit(region, size);
            return None;
        }
        entry.last_accessed_at = now;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Inserts `value`, evicting other entries in `region` when the
    /// write pushes usage past `config.max_size_bytes` (spec.md §4.B
    /// eviction). Returns every key evicted as part of this write,
    /// paired with why, so the caller can fire eviction events and
    /// statistics.
    pub fn set(
        &self,
        region: CacheRegion,
        key: &str,
        value: Value,
        ttl_secs: u64,
        config: &CacheRegionConfig,
    ) -> Vec<(String, EvictionReason)> {
        let now = Utc::now();
        let expires_at = if ttl_secs == 0 {
            None
        } else {
            Some(now + chrono::Duration::seconds(ttl_secs as i64))
        };
        let map_key = entry_key(region, key);
        let new_size = estimate_size(key, &value);

        let mut fired = Vec::new();

        if let Some(old) = self.entries.get(&map_key) {
            let old_size = estimate_size(&old.key, &old.value);
            drop(old);
            self.debit(region, old_size);
            fired.push((key.to_string(), EvictionReason::Replaced));
        }

        self.entries.insert(
            map_key.clone(),
            CacheEntry {
                key: key.to_string(),
                region,
                value,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                expires_at,
            },
        );
        self.credit(region, new_size);

        if let Some(limit) = config.max_size_bytes {
            let target = (limit as f64 * target_load_factor(config.priority)) as u64;
            while self.region_bytes_used(region) > limit {
                let Some(victim) = self.lru_candidate(region, &map_key) else {
                    break;
                };
                if let Some((_, evicted)) = self.entries.remove(&victim) {
                    let size = estimate_size(&evicted.key, &evicted.value);
                    self.debit(region, size);
                    fired.push((evicted.key, EvictionReason::CapacityReached));
                }
                if self.region_bytes_used(region) <= target {
                    break;
                }
            }
        }

        fired
    }

    /// Oldest-accessed entry in `region`, excluding `exclude_map_key`
    /// (the entry just inserted by this `set` call).
    fn lru_candidate(&self, region: CacheRegion, exclude_map_key: &str) -> Option<String> {
        let prefix = format!("{}:", region.as_str());
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix) && e.key() != exclude_map_key)
            .min_by_key(|e| e.value().last_accessed_at)
            .map(|e| e.key().clone())
    }

    /// Reclaims down to `limit` immediately, independent of any write —
    /// used when a region's policy is retightened under already-stored
    /// data (spec.md §4.B `EvictionReason::PolicyTriggered`), as opposed
    /// to the per-write reclamation in [`Self::set`].
    pub fn enforce_capacity(&self, region: CacheRegion, limit: u64, priority: u8) -> Vec<String> {
        let target = (limit as f64 * target_load_factor(priority)) as u64;
        let mut evicted = Vec::new();
        while self.region_bytes_used(region) > limit {
            let Some(victim) = self.lru_candidate(region, "") else {
                break;
            };
            if let Some((_, entry)) = self.entries.remove(&victim) {
                let size = estimate_size(&entry.key, &entry.value);
                self.debit(region, size);
                evicted.push(entry.key);
            }
            if self.region_bytes_used(region) <= target {
                break;
            }
        }
        evicted
    }

    pub fn remove(&self, region: CacheRegion, key: &str) -> bool {
        match self.entries.remove(&entry_key(region, key)) {
            Some((_, entry)) => {
                self.debit(region, estimate_size(&entry.key, &entry.value));
                true
            }
            None => false,
        }
    }

    pub fn flush_region(&self, region: CacheRegion) {
        let prefix = format!("{}:", region.as_str());
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        self.region_bytes.insert(region, 0);
    }

    pub fn entry_count(&self, region: CacheRegion) -> u64 {
        let prefix = format!("{}:", region.as_str());
        self.entries.iter().filter(|e| e.key().starts_with(&prefix)).count() as u64
    }

    pub fn region_bytes_used(&self, region: CacheRegion) -> u64 {
        self.region_bytes.get(&region).map(|v| *v).unwrap_or(0)
    }

    /// Removes entries past their expiry for `region`, returning the
    /// removed keys so the caller can fire eviction events.
    pub fn sweep_expired(&self, region: CacheRegion) -> Vec<String> {
        let prefix = format!("{}:", region.as_str());
        let now = Utc::now();
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix) && e.is_expired(now))
            .map(|e| (e.value().key.clone(), estimate_size(&e.value().key, &e.value().value)))
            .collect();
        for (key, size) in &expired {
            self.entries.remove(&entry_key(region, key));
            self.debit(region, *size);
        }
        expired.into_iter().map(|(key, _)| key).collect()
    }

    fn credit(&self, region: CacheRegion, bytes: u64) {
        *self.region_bytes.entry(region).or_insert(0) += bytes;
    }

    fn debit(&self, region: CacheRegion, bytes: u64) {
        let mut used = self.region_bytes.entry(region).or_insert(0);
        *used = used.saturating_sub(bytes);
    }
}
