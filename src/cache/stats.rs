use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;

use crate::models::cache::{CacheRegion, CacheStatistics};

/// Per-minute bucket used by the windowed rollup (spec.md §9 "prefer a
/// dedicated store ... otherwise maintain the three-layer {current,
/// minute-bucket, hour-snapshot} pattern").
#[derive(Debug, Clone, Default)]
struct MinuteBucket {
    hits: u64,
    misses: u64,
    sets: u64,
    removes: u64,
    evictions: u64,
    errors: u64,
}

/// Tracks live `CacheStatistics` per region plus a bounded per-minute
/// history used to answer windowed queries. This is the "separate
/// Statistics Store" spec.md §4.B calls out, kept in-process since no
/// teacher dependency provides a time-series backend.
pub struct StatisticsStore {
    current: DashMap<CacheRegion, CacheStatistics>,
    minute_buckets: DashMap<CacheRegion, BTreeMap<DateTime<Utc>, MinuteBucket>>,
}

impl StatisticsStore {
    pub fn new() -> Self {
        Self {
            current: DashMap::new(),
            minute_buckets: DashMap::new(),
        }
    }

    fn minute_of(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive()
            .and_hms_opt(now.time().hour(), now.time().minute(), 0)
            .and_then(|ndt| ndt.and_local_timezone(Utc).single())
            .unwrap_or(now)
    }

    fn ensure_current(&self, region: CacheRegion, now: DateTime<Utc>) {
        self.current
            .entry(region)
            .or_insert_with(|| CacheStatistics::new(now));
    }

    pub fn record_hit(&self, region: CacheRegion, get_time_micros: f64) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.hits += 1;
            Self::fold_avg(&mut stats, get_time_micros);
            stats.last_update_time = now;
        }
        self.touch_bucket(region, now, |b| b.hits += 1);
    }

    pub fn record_miss(&self, region: CacheRegion, get_time_micros: f64) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.misses += 1;
            Self::fold_avg(&mut stats, get_time_micros);
            stats.last_update_time = now;
        }
        self.touch_bucket(region, now, |b| b.misses += 1);
    }

    pub fn record_set(&self, region: CacheRegion) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.sets += 1;
            stats.last_update_time = now;
        }
        self.touch_bucket(region, now, |b| b.sets += 1);
    }

    pub fn record_remove(&self, region: CacheRegion) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.removes += 1;
            stats.last_update_time = now;
        }
        self.touch_bucket(region, now, |b| b.removes += 1);
    }

    pub fn record_eviction(&self, region: CacheRegion) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.evictions += 1;
            stats.last_update_time = now;
        }
        self.touch_bucket(region, now, |b| b.evictions += 1);
    }

    pub fn record_error(&self, region: CacheRegion) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.errors += 1;
            stats.last_update_time = now;
        }
        self.touch_bucket(region, now, |b| b.errors += 1);
    }

    pub fn set_live_gauges(&self, region: CacheRegion, entry_count: u64, memory_usage_bytes: u64) {
        let now = Utc::now();
        self.ensure_current(region, now);
        if let Some(mut stats) = self.current.get_mut(&region) {
            stats.entry_count = entry_count;
            stats.memory_usage_bytes = memory_usage_bytes;
        }
    }

    fn fold_avg(stats: &mut CacheStatistics, sample_micros: f64) {
        let total_gets = stats.hits + stats.misses;
        if total_gets <= 1 {
            stats.average_get_time_micros = sample_micros;
        } else {
            stats.average_get_time_micros +=
                (sample_micros - stats.average_get_time_micros) / total_gets as f64;
        }
    }

    fn touch_bucket(&self, region: CacheRegion, now: DateTime<Utc>, f: impl FnOnce(&mut MinuteBucket)) {
        let mut buckets = self
            .minute_buckets
            .entry(region)
            .or_insert_with(BTreeMap::new);
        let minute = Self::minute_of(now);
        f(buckets.entry(minute).or_insert_with(MinuteBucket::default));
        // Keep at most 24h of per-minute history.
        let cutoff = now - chrono::Duration::hours(24);
        buckets.retain(|ts, _| *ts >= cutoff);
    }

    pub fn current(&self, region: CacheRegion) -> CacheStatistics {
        self.current
            .get(&region)
            .map(|s| s.clone())
            .unwrap_or_else(|| CacheStatistics::new(Utc::now()))
    }

    /// Sums per-minute buckets over `[start, end]`. Open Question (d):
    /// minutes with no recorded activity are simply absent from the
    /// map, which is equivalent to treating the gap as zero.
    pub fn window(&self, region: CacheRegion, start: DateTime<Utc>, end: DateTime<Utc>) -> CacheStatistics {
        let mut out = CacheStatistics::new(start);
        if let Some(buckets) = self.minute_buckets.get(&region) {
            for (ts, bucket) in buckets.range(start..=end) {
                out.hits += bucket.hits;
                out.misses += bucket.misses;
                out.sets += bucket.sets;
                out.removes += bucket.removes;
                out.evictions += bucket.evictions;
                out.errors += bucket.errors;
                out.last_update_time = *ts;
            }
        }
        out
    }
}
