/// Per-user error occurrence ledger
///
/// One row per `(user_id, signature)`. Upserts go through the `DashMap` entry
/// API, which holds the key's shard lock for the whole read-modify-write, so
/// concurrent records on one key never lose an increment.
use crate::config::config::HistoryConfig;
use crate::config::types::{Error, HistoryEntry, Result};
use crate::history::query::{summarize, HistoryQuery, HistoryStatistics};
use crate::observability::metrics::get_metrics;
use crate::storage::SnapshotFile;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct HistoryKey {
    user_id: String,
    signature: String,
}

pub struct HistoryStore {
    entries: DashMap<HistoryKey, HistoryEntry>,
    top_k: usize,
    snapshot: SnapshotFile,
}

impl HistoryStore {
    pub fn new(top_k: usize) -> Self {
        Self::with_snapshot(top_k, SnapshotFile::in_memory())
    }

    fn with_snapshot(top_k: usize, snapshot: SnapshotFile) -> Self {
        Self {
            entries: DashMap::new(),
            top_k,
            snapshot,
        }
    }

    /// Build from config and load persisted rows
    pub fn open(config: &HistoryConfig, snapshot: SnapshotFile) -> Result<Self> {
        let store = Self::with_snapshot(config.top_k, snapshot);
        let persisted: Vec<HistoryEntry> = store.snapshot.load()?;
        let count = persisted.len();
        for entry in persisted {
            let key = HistoryKey {
                user_id: entry.user_id.clone(),
                signature: entry.signature.clone(),
            };
            store.entries.insert(key, entry);
        }
        if count > 0 {
            log::info!("Loaded {} history entries", count);
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count one occurrence of `error` for `user_id`. Returns the row after the update.
    pub fn record(&self, user_id: &str, error: &Error) -> HistoryEntry {
        self.record_at(user_id, error, Utc::now())
    }

    pub fn record_at(&self, user_id: &str, error: &Error, now: DateTime<Utc>) -> HistoryEntry {
        let key = HistoryKey {
            user_id: user_id.to_string(),
            signature: error.signature.clone(),
        };

        let updated = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.occurrence_count += 1;
                if now > entry.last_seen {
                    entry.last_seen = now;
                }
                if entry.sample_snippet.is_empty() && !error.snippet.is_empty() {
                    entry.sample_snippet = error.snippet.clone();
                }
                entry.clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(HistoryEntry {
                    user_id: user_id.to_string(),
                    signature: error.signature.clone(),
                    kind: error.kind,
                    error_name: error.name.clone(),
                    first_seen: now,
                    last_seen: now,
                    occurrence_count: 1,
                    sample_snippet: error.snippet.clone(),
                })
                .value()
                .clone(),
        };

        get_metrics().history_records.inc();
        updated
    }

    pub fn get(&self, user_id: &str, signature: &str) -> Option<HistoryEntry> {
        let key = HistoryKey {
            user_id: user_id.to_string(),
            signature: signature.to_string(),
        };
        self.entries.get(&key).map(|entry| entry.value().clone())
    }

    pub fn query(&self, user_id: &str, filters: &HistoryQuery) -> Vec<HistoryEntry> {
        let matching = self
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id && filters.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        filters.finish(matching)
    }

    pub fn statistics(&self, user_id: &str) -> HistoryStatistics {
        let entries = self
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        summarize(user_id, entries, self.top_k)
    }

    /// Delete rows whose `last_seen` is older than `max_age`
    pub fn retain(&self, max_age: Duration) -> usize {
        self.retain_at(max_age, Utc::now())
    }

    pub fn retain_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return 0;
        };

        let stale: Vec<HistoryKey> = self
            .entries
            .iter()
            .filter(|entry| entry.last_seen < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        // Re-checked under the entry lock: a record since the scan keeps the row
        let removed = stale
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, entry| entry.last_seen < cutoff)
                    .is_some()
            })
            .count();

        if removed > 0 {
            get_metrics().history_retained_removed.add(removed as u64);
            log::info!("Retention removed {} history entries", removed);
        }
        removed
    }

    /// Persist all rows (durable policy only)
    pub fn flush(&self) -> Result<()> {
        if !self.snapshot.is_durable() {
            return Ok(());
        }
        let mut entries: Vec<HistoryEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            (a.user_id.as_str(), a.signature.as_str()).cmp(&(b.user_id.as_str(), b.signature.as_str()))
        });
        self.snapshot.save(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ErrorKind, Position};
    use std::sync::Arc;
    use std::thread;

    fn zero_division() -> Error {
        Error::new(
            ErrorKind::Runtime,
            "ZeroDivisionError",
            "division by zero",
            Position::new(1, 5, 3),
            "x = 1/0",
        )
    }

    #[test]
    fn test_record_twice_is_one_row() {
        let store = HistoryStore::new(5);
        let error = zero_division();

        assert_eq!(store.record("u1", &error).occurrence_count, 1);
        assert_eq!(store.record("u1", &error).occurrence_count, 2);
        assert_eq!(store.len(), 1);

        let row = store.get("u1", &error.signature).unwrap();
        assert_eq!(row.error_name, "ZeroDivisionError");
        assert_eq!(row.sample_snippet, "x = 1/0");
        assert!(row.last_seen >= row.first_seen);
    }

    #[test]
    fn test_users_are_separate() {
        let store = HistoryStore::new(5);
        store.record("u1", &zero_division());
        store.record("u2", &zero_division());
        assert_eq!(store.len(), 2);
        assert_eq!(store.statistics("u1").total, 1);
    }

    #[test]
    fn test_concurrent_records_lose_nothing() {
        let store = Arc::new(HistoryStore::new(5));
        let error = zero_division();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let error = error.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.record("u1", &error);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("u1", &error.signature).unwrap().occurrence_count, 4000);
    }

    #[test]
    fn test_retain_removes_only_stale() {
        let store = HistoryStore::new(5);
        let now = Utc::now();
        let old = Error::new(ErrorKind::Runtime, "NameError", "name 'x' is not defined", Position::new(1, 1, 1), "x");
        store.record_at("u1", &old, now - chrono::Duration::days(100));
        store.record_at("u1", &zero_division(), now);

        let removed = store.retain_at(Duration::from_secs(90 * 24 * 3600), now);
        assert_eq!(removed, 1);
        assert!(store.get("u1", &old.signature).is_none());
        assert_eq!(store.retain_at(Duration::from_secs(90 * 24 * 3600), now), 0);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let config = HistoryConfig::default();

        let store = HistoryStore::open(&config, SnapshotFile::new(Some(path.clone()))).unwrap();
        store.record("u1", &zero_division());
        store.record("u1", &zero_division());
        store.flush().unwrap();

        let reopened = HistoryStore::open(&config, SnapshotFile::new(Some(path))).unwrap();
        assert_eq!(
            reopened.get("u1", &zero_division().signature).unwrap().occurrence_count,
            2
        );
    }
}
