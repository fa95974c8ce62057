/// Signature-keyed explanation cache
///
/// Entries live in a sharded `DashMap`, so operations on different signatures
/// never contend on one lock. Every write stamps a fresh generation; the
/// expiry sweep removes an entry only while its generation is unchanged, so a
/// concurrent refresh always survives.
use crate::cache::CacheStats;
use crate::config::config::CacheConfig;
use crate::config::types::{CachedExplanation, Explanation, Result};
use crate::observability::metrics::get_metrics;
use crate::storage::SnapshotFile;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct Slot {
    entry: CachedExplanation,
    generation: u64,
    /// Recency tick of the last `get` hit or `put`
    last_used: u64,
}

pub struct ExplanationCache {
    entries: DashMap<String, Slot>,
    max_entries: usize,
    default_ttl: Duration,
    generation: AtomicU64,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Serializes eviction passes; taken only by writers over capacity
    evicting: Mutex<()>,
    snapshot: SnapshotFile,
}

impl ExplanationCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self::with_snapshot(max_entries, default_ttl, SnapshotFile::in_memory())
    }

    fn with_snapshot(max_entries: usize, default_ttl: Duration, snapshot: SnapshotFile) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            default_ttl,
            generation: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            evicting: Mutex::new(()),
            snapshot,
        }
    }

    /// Build from config and load any persisted entries that have not expired.
    pub fn open(config: &CacheConfig, snapshot: SnapshotFile) -> Result<Self> {
        let cache = Self::with_snapshot(
            config.max_entries,
            Duration::from_secs(config.default_ttl_secs),
            snapshot,
        );

        let now = Utc::now();
        let persisted: Vec<CachedExplanation> = cache.snapshot.load()?;
        let mut loaded = 0usize;
        for entry in persisted {
            if entry.is_expired_at(now) {
                continue;
            }
            let slot = Slot {
                generation: cache.next_generation(),
                last_used: cache.tick(),
                entry,
            };
            cache.entries.insert(slot.entry.signature.clone(), slot);
            loaded += 1;
        }
        if loaded > 0 {
            log::info!("Loaded {} cached explanations", loaded);
        }
        if cache.entries.len() > cache.max_entries {
            cache.evict_overflow();
        }
        Ok(cache)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up an explanation. A hit bumps `access_count`; expired entries are
    /// misses even before a sweep removes them.
    pub fn get(&self, signature: &str) -> Option<Explanation> {
        self.get_at(signature, Utc::now())
    }

    pub fn get_at(&self, signature: &str, now: DateTime<Utc>) -> Option<Explanation> {
        let found = match self.entries.get_mut(signature) {
            Some(mut slot) if !slot.entry.is_expired_at(now) => {
                slot.entry.access_count += 1;
                slot.last_used = self.tick();
                Some(slot.entry.explanation())
            }
            _ => None,
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            get_metrics().cache_hits.inc();
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            get_metrics().cache_misses.inc();
        }
        found
    }

    /// Lookup that touches neither counters nor recency
    pub fn peek(&self, signature: &str) -> Option<Explanation> {
        let now = Utc::now();
        self.entries
            .get(signature)
            .filter(|slot| !slot.entry.is_expired_at(now))
            .map(|slot| slot.entry.explanation())
    }

    /// Full record, for inspection and persistence
    pub fn entry(&self, signature: &str) -> Option<CachedExplanation> {
        self.entries.get(signature).map(|slot| slot.entry.clone())
    }

    /// Insert or refresh. `ttl` of zero stores an entry that is already expired.
    pub fn put(&self, signature: &str, explanation: Explanation, ttl: Duration) {
        self.put_at(signature, explanation, ttl, Utc::now())
    }

    pub fn put_at(&self, signature: &str, explanation: Explanation, ttl: Duration, now: DateTime<Utc>) {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let generation = self.next_generation();
        let last_used = self.tick();

        let mut entry = CachedExplanation {
            signature: signature.to_string(),
            error_name: explanation.error_name,
            explanation_text: explanation.explanation_text,
            suggested_fix: explanation.suggested_fix,
            created_at: now,
            expires_at,
            access_count: 0,
        };

        match self.entries.entry(signature.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                entry.access_count = slot.entry.access_count;
                slot.entry = entry;
                slot.generation = generation;
                slot.last_used = last_used;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    entry,
                    generation,
                    last_used,
                });
            }
        }

        if self.entries.len() > self.max_entries {
            self.evict_overflow();
        }
    }

    /// Bring the cache back under capacity.
    ///
    /// Only writers that find the cache over capacity take the eviction lock,
    /// and each re-checks the length once it holds it, so a put never returns
    /// while the cache it observed after inserting is still too large.
    fn evict_overflow(&self) {
        let _guard = self.evicting.lock();
        while self.entries.len() > self.max_entries {
            self.evict_batch();
        }
    }

    /// Evict least recently used entries until the cache is a little under
    /// capacity, so a burst of puts does not evict one entry per insert.
    fn evict_batch(&self) {
        let len = self.entries.len();
        if len <= self.max_entries {
            return;
        }
        let target = self.max_entries - self.max_entries / 16;
        let excess = len - target;

        let mut candidates: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|slot| (slot.last_used, slot.key().clone()))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0u64;
        for (last_used, key) in candidates.into_iter().take(excess) {
            // Skip entries touched since the snapshot above
            if self
                .entries
                .remove_if(&key, |_, slot| slot.last_used == last_used)
                .is_some()
            {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            get_metrics().cache_evictions.add(evicted);
            log::debug!("Evicted {} cached explanations", evicted);
        }
    }

    /// Remove expired entries. Idempotent and safe alongside `get`/`put`.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|slot| slot.entry.is_expired_at(now))
            .map(|slot| (slot.key().clone(), slot.generation))
            .collect();

        let mut removed = 0;
        for (key, generation) in expired {
            let gone = self.entries.remove_if(&key, |_, slot| {
                slot.generation == generation && slot.entry.is_expired_at(now)
            });
            if gone.is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            get_metrics().cache_expired_swept.add(removed as u64);
            log::debug!("Swept {} expired explanations", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats::new(hits, misses, self.evictions.load(Ordering::Relaxed), self.entries.len())
    }

    /// Persist all entries (durable policy only)
    pub fn flush(&self) -> Result<()> {
        if !self.snapshot.is_durable() {
            return Ok(());
        }
        let mut entries: Vec<CachedExplanation> =
            self.entries.iter().map(|slot| slot.entry.clone()).collect();
        entries.sort_by(|a, b| a.signature.cmp(&b.signature));
        self.snapshot.save(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn explanation(name: &str) -> Explanation {
        Explanation {
            error_name: name.to_string(),
            explanation_text: format!("{} happened", name),
            suggested_fix: "fix it".to_string(),
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = ExplanationCache::new(10, HOUR);
        assert!(cache.get("aaaa").is_none());

        cache.put("aaaa", explanation("NameError"), HOUR);
        assert_eq!(cache.get("aaaa").unwrap().error_name, "NameError");
        cache.get("aaaa");

        let stats = cache.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(cache.entry("aaaa").unwrap().access_count, 2);
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let cache = ExplanationCache::new(10, HOUR);
        cache.put("aaaa", explanation("TypeError"), Duration::ZERO);
        assert!(cache.get("aaaa").is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expiry_is_created_plus_ttl() {
        let cache = ExplanationCache::new(10, HOUR);
        let now = Utc::now();
        cache.put_at("aaaa", explanation("KeyError"), Duration::from_secs(60), now);

        assert!(cache.get_at("aaaa", now + chrono::Duration::seconds(59)).is_some());
        assert!(cache.get_at("aaaa", now + chrono::Duration::seconds(60)).is_none());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let cache = ExplanationCache::new(10, HOUR);
        let now = Utc::now();
        cache.put_at("old", explanation("A"), Duration::from_secs(1), now);
        cache.put_at("new", explanation("B"), HOUR, now);

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(cache.sweep_expired_at(later), 1);
        assert_eq!(cache.sweep_expired_at(later), 0);
        assert!(cache.peek("new").is_some());
    }

    #[test]
    fn test_refresh_survives_sweep() {
        let cache = ExplanationCache::new(10, HOUR);
        let now = Utc::now();
        cache.put_at("aaaa", explanation("A"), Duration::from_secs(1), now);

        let later = now + chrono::Duration::seconds(5);
        cache.put_at("aaaa", explanation("A"), HOUR, later);
        assert_eq!(cache.sweep_expired_at(later), 0);
        assert!(cache.get_at("aaaa", later).is_some());
    }

    #[test]
    fn test_lru_eviction_keeps_recently_used() {
        let cache = ExplanationCache::new(4, HOUR);
        for key in ["a", "b", "c", "d"] {
            cache.put(key, explanation(key), HOUR);
        }
        // Touch "a" so "b" is the oldest
        cache.get("a");
        cache.put("e", explanation("e"), HOUR);

        assert_eq!(cache.len(), 4);
        assert!(cache.peek("a").is_some());
        assert!(cache.peek("b").is_none());
        assert!(cache.peek("e").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_peek_does_not_count() {
        let cache = ExplanationCache::new(10, HOUR);
        cache.put("aaaa", explanation("A"), HOUR);
        assert!(cache.peek("aaaa").is_some());
        assert_eq!(cache.stats().requests, 0);
        assert_eq!(cache.entry("aaaa").unwrap().access_count, 0);
    }

    #[test]
    fn test_concurrent_put_get_sweep() {
        let cache = Arc::new(ExplanationCache::new(1000, HOUR));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("sig-{}", i % 50);
                        if t % 2 == 0 {
                            cache.put(&key, explanation("E"), HOUR);
                        } else {
                            cache.get(&key);
                            cache.sweep_expired();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 50);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let config = CacheConfig::default();

        let cache = ExplanationCache::open(&config, SnapshotFile::new(Some(path.clone()))).unwrap();
        cache.put("live", explanation("A"), HOUR);
        cache.put("dead", explanation("B"), Duration::ZERO);
        cache.flush().unwrap();

        let reopened = ExplanationCache::open(&config, SnapshotFile::new(Some(path))).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.peek("live").unwrap().error_name, "A");
    }
}
