//! Explanation cache
//!
//! Signature-keyed, TTL-bounded, capacity-bounded store of explanations.

pub mod explanation;

pub use explanation::ExplanationCache;

use serde::{Deserialize, Serialize};

/// Cache traffic since construction
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn new(hits: u64, misses: u64, evictions: u64, entries: usize) -> Self {
        let requests = hits + misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64
        };
        Self {
            requests,
            hits,
            misses,
            hit_rate,
            evictions,
            entries,
        }
    }
}
