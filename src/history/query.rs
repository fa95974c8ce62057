/// History filters and per-user statistics
use crate::config::types::{ErrorKind, HistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Filters for [`crate::history::HistoryStore::query`]. All set filters must match.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub kind: Option<ErrorKind>,
    pub min_count: Option<u64>,
    /// Only entries seen at or after this time
    pub since: Option<DateTime<Utc>>,
    pub signature: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn min_count(mut self, count: u64) -> Self {
        self.min_count = Some(count);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        self.kind.map_or(true, |kind| entry.kind == kind)
            && self.min_count.map_or(true, |min| entry.occurrence_count >= min)
            && self.since.map_or(true, |since| entry.last_seen >= since)
            && self
                .signature
                .as_ref()
                .map_or(true, |sig| &entry.signature == sig)
    }

    /// Sort newest first and apply the limit
    pub fn finish(&self, mut entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        entries.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        if let Some(limit) = self.limit {
            entries.truncate(limit);
        }
        entries
    }
}

/// Summary of one user's history
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatistics {
    pub user_id: String,
    /// Sum of occurrence counts
    pub total: u64,
    /// Distinct error names
    pub unique_kinds: usize,
    pub unique_signatures: usize,
    pub top_k_by_count: Vec<HistoryEntry>,
}

/// Descending count, ties broken by the most recent `last_seen`
pub fn by_count_then_recency(a: &HistoryEntry, b: &HistoryEntry) -> Ordering {
    b.occurrence_count
        .cmp(&a.occurrence_count)
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.signature.cmp(&b.signature))
}

pub fn summarize(user_id: &str, mut entries: Vec<HistoryEntry>, top_k: usize) -> HistoryStatistics {
    let total = entries.iter().map(|e| e.occurrence_count).sum();
    let unique_kinds = entries
        .iter()
        .map(|e| e.error_name.as_str())
        .collect::<HashSet<_>>()
        .len();
    let unique_signatures = entries.len();

    entries.sort_by(by_count_then_recency);
    entries.truncate(top_k);

    HistoryStatistics {
        user_id: user_id.to_string(),
        total,
        unique_kinds,
        unique_signatures,
        top_k_by_count: entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sig: &str, name: &str, count: u64, seen_secs: i64) -> HistoryEntry {
        let seen = DateTime::<Utc>::from_timestamp(1_700_000_000 + seen_secs, 0).unwrap();
        HistoryEntry {
            user_id: "u1".to_string(),
            signature: sig.to_string(),
            kind: ErrorKind::Runtime,
            error_name: name.to_string(),
            first_seen: seen,
            last_seen: seen,
            occurrence_count: count,
            sample_snippet: String::new(),
        }
    }

    #[test]
    fn test_top_k_ties_prefer_recent() {
        let stats = summarize(
            "u1",
            vec![
                entry("a", "NameError", 3, 10),
                entry("b", "NameError", 5, 0),
                entry("c", "TypeError", 3, 20),
            ],
            2,
        );
        let order: Vec<_> = stats.top_k_by_count.iter().map(|e| e.signature.as_str()).collect();
        assert_eq!(order, vec!["b", "c"]);
        assert_eq!(stats.total, 11);
        assert_eq!(stats.unique_kinds, 2);
        assert_eq!(stats.unique_signatures, 3);
    }

    #[test]
    fn test_query_filters_and_limit() {
        let query = HistoryQuery::new().min_count(2).limit(1);
        let entries: Vec<_> = vec![entry("a", "X", 1, 30), entry("b", "Y", 2, 10), entry("c", "Z", 4, 20)]
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        let result = query.finish(entries);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].signature, "c");
    }

    #[test]
    fn test_since_is_inclusive() {
        let e = entry("a", "X", 1, 0);
        assert!(HistoryQuery::new().since(e.last_seen).matches(&e));
        assert!(!HistoryQuery::new().kind(ErrorKind::Syntax).matches(&e));
    }
}
