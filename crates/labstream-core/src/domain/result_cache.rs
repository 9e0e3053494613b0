//! Deduplicated discovery results with age-out.
//!
//! Discovery replies arrive repeatedly (one per query wave, often several
//! per wave when a stream is reachable over more than one address).  The
//! cache keys them by stream uid so every stream appears once, remembers
//! when each was last heard from, and drops streams that have gone quiet.
//!
//! The cache is a plain value; resolvers wrap it in a `Mutex` held only
//! for the duration of one insert or snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::stream_info::StreamInfo;
use crate::time::clock::Clock;

struct CachedResult {
    info: StreamInfo,
    first_seen: u64,
    last_seen: f64,
}

/// Results of one resolve operation, keyed by uid.
pub struct ResultCache {
    entries: HashMap<String, CachedResult>,
    arrivals: u64,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            arrivals: 0,
            clock,
        }
    }

    /// Inserts or refreshes a stream.  Returns `true` if the uid is new.
    pub fn insert(&mut self, info: StreamInfo) -> bool {
        let now = self.clock.now();
        match self.entries.get_mut(info.uid()) {
            Some(entry) => {
                entry.info = info;
                entry.last_seen = now;
                false
            }
            None => {
                self.arrivals += 1;
                self.entries.insert(
                    info.uid().to_string(),
                    CachedResult {
                        info,
                        first_seen: self.arrivals,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Number of distinct streams currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts streams unseen for more than `forget_after` seconds and returns
    /// the rest in order of first arrival.
    pub fn snapshot(&mut self, forget_after: f64) -> Vec<StreamInfo> {
        let now = self.clock.now();
        self.entries
            .retain(|_, entry| now - entry.last_seen <= forget_after);
        self.ordered()
    }

    /// All cached streams in order of first arrival, without eviction.
    pub fn results(&self) -> Vec<StreamInfo> {
        self.ordered()
    }

    fn ordered(&self) -> Vec<StreamInfo> {
        let mut entries: Vec<&CachedResult> = self.entries.values().collect();
        entries.sort_by_key(|e| e.first_seen);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
