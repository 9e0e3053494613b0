//! Outlet-side memo of query results.
//!
//! An outlet's descriptor never changes while it is published, so whether a
//! given query text matches it never changes either.  Resolvers repeat the
//! same query every wave, so caching the verdict per query text saves a
//! parse and evaluation per datagram.
//!
//! The cache is bounded: once it holds more than `capacity` entries the
//! least recently used half is dropped.  Malformed queries are never cached.

use std::collections::HashMap;

use crate::domain::stream_info::StreamInfo;
use crate::query::parser::{parse_predicate, QueryParseError};

struct CachedVerdict {
    matched: bool,
    last_used: u64,
}

/// Bounded map from query text to "does it match this outlet".
pub struct QueryCache {
    capacity: usize,
    entries: HashMap<String, CachedVerdict>,
    tick: u64,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            tick: 0,
        }
    }

    /// Returns whether `query` matches `info`, parsing it on a cache miss.
    ///
    /// # Errors
    ///
    /// [`QueryParseError`] for malformed queries; the cache is left untouched.
    pub fn matches(&mut self, query: &str, info: &StreamInfo) -> Result<bool, QueryParseError> {
        self.tick += 1;
        if let Some(verdict) = self.entries.get_mut(query) {
            verdict.last_used = self.tick;
            return Ok(verdict.matched);
        }

        let matched = parse_predicate(query)?.evaluate(info);
        self.entries.insert(
            query.to_string(),
            CachedVerdict {
                matched,
                last_used: self.tick,
            },
        );
        if self.entries.len() > self.capacity {
            self.evict_oldest_half();
        }
        Ok(matched)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest_half(&mut self) {
        let mut ages: Vec<u64> = self.entries.values().map(|v| v.last_used).collect();
        ages.sort_unstable();
        let cutoff = ages[ages.len() / 2];
        self.entries.retain(|_, v| v.last_used >= cutoff);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel_format::ChannelFormat;

    fn make_info() -> StreamInfo {
        StreamInfo::new("cached", "EEG", 2, 100.0, ChannelFormat::Int16, "").expect("valid")
    }

    #[test]
    fn test_repeated_query_returns_same_verdict() {
        // Arrange
        let info = make_info();
        let mut cache = QueryCache::new(10);

        // Act
        let first = cache.matches("name='cached'", &info).expect("parse");
        let second = cache.matches("name='cached'", &info).expect("cached");

        // Assert
        assert!(first && second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_malformed_query_is_not_cached() {
        let mut cache = QueryCache::new(10);

        let result = cache.matches("name=", &make_info());

        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_stays_bounded_and_keeps_recent_entries() {
        // Arrange
        let info = make_info();
        let mut cache = QueryCache::new(8);

        // Act
        for i in 0..100 {
            cache
                .matches(&format!("source_id='{i}'"), &info)
                .expect("parse");
        }

        // Assert
        assert!(cache.len() <= 8);
        assert!(cache.entries.contains_key("source_id='99'"));
    }
}
