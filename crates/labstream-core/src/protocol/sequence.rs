//! Per-outlet sample numbering.
//!
//! # Why number samples? (for beginners)
//!
//! Every sample an outlet accepts gets a sequence number, and a sample batch
//! on the wire carries the number of its first sample in the message header.
//! An inlet that sees batch `[10..14]` followed by batch `[17..20]` knows
//! that samples 15 and 16 were dropped, either because its consumer queue
//! overflowed on the outlet side or because the connection was rebuilt.
//!
//! Chunks reserve a whole range at once so the samples of one chunk are
//! always numbered consecutively, even when other threads push concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing counter of sample sequence numbers.
///
/// # Examples
///
/// ```rust
/// use labstream_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.reserve(3), 1);
/// assert_eq!(counter.next(), 4);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next sequence number and advances the counter by one.
    ///
    /// Wraps from `u64::MAX` to 0.
    pub fn next(&self) -> u64 {
        // Relaxed: callers that need ordering against the queues hold the
        // send buffer lock while numbering.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves `count` consecutive numbers and returns the first one.
    pub fn reserve(&self, count: u64) -> u64 {
        self.inner.fetch_add(count, Ordering::Relaxed)
    }

    /// The number the next sample will get.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_zero() {
        // Arrange
        let counter = SequenceCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 0);
    }

    #[test]
    fn test_reserve_hands_out_consecutive_ranges() {
        // Arrange
        let counter = SequenceCounter::new();

        // Act
        let a = counter.reserve(5);
        let b = counter.reserve(2);

        // Assert
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        assert_eq!(counter.current(), 7);
    }

    #[test]
    fn test_sequence_counter_wraps_at_u64_max() {
        // Arrange – start the counter one step before overflow
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap, u64::MAX);
        assert_eq!(after_wrap, 0);
    }

    #[test]
    fn test_concurrent_reservations_never_overlap() {
        // Arrange
        let counter = Arc::new(SequenceCounter::new());

        // Act – each thread reserves ranges of 3
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..200).map(|_| c.reserve(3)).collect::<Vec<_>>())
            })
            .collect();
        let mut starts: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – starts are distinct multiples of 3
        starts.sort_unstable();
        starts.dedup();
        assert_eq!(starts.len(), 1600);
        assert!(starts.iter().all(|s| s % 3 == 0));
    }
}
