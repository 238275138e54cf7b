//! Per-day metric snapshots with time-derived freshness.
//!
//! One snapshot per calendar day, stored under `health_cache_{YYYY-MM-DD}`.
//! Writes are last-write-wins. Freshness is never persisted; it is computed
//! from `now - cached_at` on every read.

use std::sync::Arc;

use time::{Date, Duration as TimeDuration};
use tracing::{debug, info, warn};

use vitals_store::KeyValueStore;
use vitals_types::{
    CachedMetricSnapshot, DailyMetrics, Freshness, FreshnessThresholds, format_date_key,
    parse_date_key,
};

use crate::clock::Clock;
use crate::error::Result;

const CACHE_PREFIX: &str = "health_cache_";

/// Default retention for [`FreshnessCache::prune_older_than`].
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

fn cache_key(date: Date) -> String {
    format!("{}{}", CACHE_PREFIX, format_date_key(date))
}

/// A cache read together with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub data: Option<CachedMetricSnapshot>,
    pub freshness: Freshness,
    pub needs_refresh: bool,
}

impl CacheLookup {
    fn missing() -> Self {
        Self {
            data: None,
            freshness: Freshness::Old,
            needs_refresh: true,
        }
    }

    /// Whether a snapshot exists and is fresh.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.data.is_some() && self.freshness.is_fresh()
    }
}

/// Freshness-aware store of daily metric snapshots.
pub struct FreshnessCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    thresholds: FreshnessThresholds,
}

impl std::fmt::Debug for FreshnessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessCache")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl FreshnessCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        thresholds: FreshnessThresholds,
    ) -> Self {
        Self {
            store,
            clock,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> FreshnessThresholds {
        self.thresholds
    }

    /// Store `metrics` for `date`, stamped with the current time.
    pub fn cache_snapshot(&self, date: Date, metrics: DailyMetrics) -> Result<CachedMetricSnapshot> {
        let snapshot = CachedMetricSnapshot {
            date_key: date,
            metrics,
            cached_at: self.clock.now(),
        };
        self.store.set_json(&cache_key(date), &snapshot)?;
        debug!("Cached snapshot for {}", format_date_key(date));
        Ok(snapshot)
    }

    /// Read the snapshot for `date` and classify it.
    ///
    /// A missing or unreadable entry is reported as old and in need of a
    /// refresh.
    pub fn get_with_freshness(&self, date: Date) -> CacheLookup {
        match self.read(date) {
            Some(snapshot) => {
                let freshness = self
                    .thresholds
                    .classify_at(snapshot.cached_at, self.clock.now());
                CacheLookup {
                    data: Some(snapshot),
                    freshness,
                    needs_refresh: freshness.needs_refresh(),
                }
            }
            None => CacheLookup::missing(),
        }
    }

    /// Snapshots for the last `days` calendar days, most recent first.
    ///
    /// Days without an entry are skipped.
    pub fn get_range(&self, days: u32) -> Vec<CachedMetricSnapshot> {
        let today = self.clock.today();
        (0..i64::from(days))
            .filter_map(|offset| today.checked_sub(TimeDuration::days(offset)))
            .filter_map(|date| self.read(date))
            .collect()
    }

    /// Delete snapshots more than `days` days older than today.
    ///
    /// Entries whose key is not a valid date are removed too. Returns the
    /// number of entries removed.
    pub fn prune_older_than(&self, days: u32) -> Result<usize> {
        let today = self.clock.today();
        let cutoff = today
            .checked_sub(TimeDuration::days(i64::from(days)))
            .unwrap_or(Date::MIN);

        let mut removed = 0;
        for key in self.store.keys_with_prefix(CACHE_PREFIX)? {
            let expired = match parse_date_key(&key[CACHE_PREFIX.len()..]) {
                Ok(date) => date < cutoff,
                Err(e) => {
                    warn!("Removing cache entry with bad key {}: {}", key, e);
                    true
                }
            };
            if expired {
                self.store.remove(&key)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Pruned {} cached snapshots older than {} days", removed, days);
        }
        Ok(removed)
    }

    /// Remove every cached snapshot.
    pub fn clear(&self) -> Result<usize> {
        let keys = self.store.keys_with_prefix(CACHE_PREFIX)?;
        for key in &keys {
            self.store.remove(key)?;
        }
        Ok(keys.len())
    }

    fn read(&self, date: Date) -> Option<CachedMetricSnapshot> {
        match self.store.get_json::<CachedMetricSnapshot>(&cache_key(date)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Cache read for {} failed: {}", format_date_key(date), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use time::macros::{date, datetime};
    use vitals_store::MemoryStore;

    fn cache() -> (Arc<ManualClock>, Arc<MemoryStore>, FreshnessCache) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-20 09:00 UTC)));
        let store = Arc::new(MemoryStore::new());
        let cache = FreshnessCache::new(
            store.clone(),
            clock.clone(),
            FreshnessThresholds::default(),
        );
        (clock, store, cache)
    }

    fn metrics(steps: u32) -> DailyMetrics {
        DailyMetrics {
            steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_after_write() {
        let (_, _, cache) = cache();
        cache.cache_snapshot(date!(2024 - 05 - 20), metrics(100)).unwrap();

        let lookup = cache.get_with_freshness(date!(2024 - 05 - 20));
        assert!(lookup.is_fresh());
        assert!(!lookup.needs_refresh);
        assert_eq!(lookup.data.unwrap().metrics.steps, 100);
    }

    #[test]
    fn test_freshness_ages() {
        let (clock, _, cache) = cache();
        let today = date!(2024 - 05 - 20);
        cache.cache_snapshot(today, metrics(1)).unwrap();

        clock.advance(Duration::from_secs(6 * 60));
        let lookup = cache.get_with_freshness(today);
        assert_eq!(lookup.freshness, Freshness::Stale);
        assert!(lookup.needs_refresh);

        clock.advance(Duration::from_secs(10 * 60));
        assert_eq!(cache.get_with_freshness(today).freshness, Freshness::Old);
    }

    #[test]
    fn test_missing_is_old() {
        let (_, _, cache) = cache();
        let lookup = cache.get_with_freshness(date!(2024 - 05 - 20));
        assert_eq!(lookup, CacheLookup::missing());
        assert!(!lookup.is_fresh());
    }

    #[test]
    fn test_last_write_wins() {
        let (_, _, cache) = cache();
        let day = date!(2024 - 05 - 19);
        cache.cache_snapshot(day, metrics(1)).unwrap();
        cache.cache_snapshot(day, metrics(2)).unwrap();
        assert_eq!(
            cache.get_with_freshness(day).data.unwrap().metrics.steps,
            2
        );
    }

    #[test]
    fn test_range_skips_missing_days() {
        let (_, _, cache) = cache();
        cache.cache_snapshot(date!(2024 - 05 - 20), metrics(20)).unwrap();
        cache.cache_snapshot(date!(2024 - 05 - 18), metrics(18)).unwrap();
        cache.cache_snapshot(date!(2024 - 05 - 10), metrics(10)).unwrap();

        let range = cache.get_range(7);
        let steps: Vec<_> = range.iter().map(|s| s.metrics.steps).collect();
        assert_eq!(steps, vec![20, 18]);
    }

    #[test]
    fn test_prune_retains_recent() {
        let (_, store, cache) = cache();
        cache.cache_snapshot(date!(2024 - 04 - 10), metrics(40)).unwrap();
        cache.cache_snapshot(date!(2024 - 05 - 10), metrics(10)).unwrap();
        store.set("health_cache_garbage", "{}").unwrap();

        assert_eq!(cache.prune_older_than(30).unwrap(), 2);
        assert!(cache.get_with_freshness(date!(2024 - 04 - 10)).data.is_none());
        assert!(cache.get_with_freshness(date!(2024 - 05 - 10)).data.is_some());
    }

    #[test]
    fn test_read_failure_reports_missing() {
        let (_, store, cache) = cache();
        cache.cache_snapshot(date!(2024 - 05 - 20), metrics(1)).unwrap();
        store.set_fail_reads(true);
        assert!(cache.get_with_freshness(date!(2024 - 05 - 20)).needs_refresh);
    }

    #[test]
    fn test_clear() {
        let (_, store, cache) = cache();
        cache.cache_snapshot(date!(2024 - 05 - 20), metrics(1)).unwrap();
        store.set("device_id", "keep").unwrap();

        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(store.get("device_id").unwrap().as_deref(), Some("keep"));
    }
}
