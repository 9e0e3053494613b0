//! Bounded per-consumer sample queue with drop-oldest overflow.
//!
//! # Why drop the oldest? (for beginners)
//!
//! A producer must never wait for a slow consumer, and a consumer that falls
//! behind is better served by recent data than by stale data.  When a queue
//! is full, a push therefore discards the oldest unread sample and keeps the
//! new one, so after any burst the queue holds exactly the newest
//! `capacity` samples.
//!
//! The queue is used on both ends of a connection: the outlet keeps one per
//! connected inlet, and every inlet keeps one between its receiver task and
//! the caller's `pull_*` calls.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cancellation::registry::{lock_or_recover, Cancellable};
use crate::domain::sample::Sample;

/// Result of a blocking [`ConsumerQueue::pop`].
#[derive(Debug, Clone, PartialEq)]
pub enum PopResult {
    Sample(Sample),
    TimedOut,
    /// [`ConsumerQueue::interrupt`] was called while waiting.
    Interrupted,
}

type PushListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct QueueState {
    samples: VecDeque<Sample>,
    dropped: u64,
    /// Bumped by every interrupt; waiters compare against the value they
    /// started with.
    interrupts: u64,
}

/// A bounded FIFO of samples shared between one writer and one reader.
pub struct ConsumerQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
    listener: Mutex<Option<PushListener>>,
}

impl ConsumerQueue {
    /// Creates a queue holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                samples: VecDeque::with_capacity(capacity.min(4096)),
                ..QueueState::default()
            }),
            available: Condvar::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Installs a callback run after every push, outside the queue lock.
    ///
    /// Async readers use it to wake a `tokio::sync::Notify`.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock_or_recover(&self.listener, "consumer queue listener") = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        lock_or_recover(&self.listener, "consumer queue listener").take();
    }

    fn notify_listener(&self) {
        let listener = lock_or_recover(&self.listener, "consumer queue listener").clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn push_locked(&self, state: &mut QueueState, sample: Sample) -> bool {
        let mut overflowed = false;
        while state.samples.len() >= self.capacity {
            state.samples.pop_front();
            state.dropped += 1;
            overflowed = true;
        }
        state.samples.push_back(sample);
        overflowed
    }

    /// Appends one sample.  Returns `true` if an older sample was dropped.
    pub fn push(&self, sample: Sample) -> bool {
        let overflowed = {
            let mut state = lock_or_recover(&self.state, "consumer queue");
            self.push_locked(&mut state, sample)
        };
        self.available.notify_all();
        self.notify_listener();
        overflowed
    }

    /// Appends a run of samples under one lock so readers never see half a
    /// chunk.  Returns how many older samples were dropped.
    pub fn push_many(&self, samples: impl IntoIterator<Item = Sample>) -> u64 {
        let dropped = {
            let mut state = lock_or_recover(&self.state, "consumer queue");
            let before = state.dropped;
            for sample in samples {
                self.push_locked(&mut state, sample);
            }
            state.dropped - before
        };
        self.available.notify_all();
        self.notify_listener();
        dropped
    }

    /// Takes the oldest sample without blocking.
    pub fn try_pop(&self) -> Option<Sample> {
        lock_or_recover(&self.state, "consumer queue").samples.pop_front()
    }

    /// Takes the oldest sample, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> PopResult {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock_or_recover(&self.state, "consumer queue");
        let epoch = state.interrupts;
        loop {
            if let Some(sample) = state.samples.pop_front() {
                return PopResult::Sample(sample);
            }
            if state.interrupts != epoch {
                return PopResult::Interrupted;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return PopResult::TimedOut;
                    }
                    deadline - now
                }
                // Overflowed Instant: treat as "forever", re-checked hourly.
                None => Duration::from_secs(3600),
            };
            state = self
                .available
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Takes every buffered sample.
    pub fn drain(&self) -> Vec<Sample> {
        lock_or_recover(&self.state, "consumer queue").samples.drain(..).collect()
    }

    /// Takes at most `max` buffered samples.
    pub fn drain_up_to(&self, max: usize) -> Vec<Sample> {
        let mut state = lock_or_recover(&self.state, "consumer queue");
        let n = max.min(state.samples.len());
        state.samples.drain(..n).collect()
    }

    /// Puts samples taken earlier back in front of the queue, in their
    /// original order.
    ///
    /// Samples pushed in the meantime stay behind them.  If the queue cannot
    /// hold both, the oldest of the returned samples are dropped.
    pub fn unread(&self, samples: Vec<Sample>) {
        if samples.is_empty() {
            return;
        }
        {
            let mut state = lock_or_recover(&self.state, "consumer queue");
            let room = self.capacity.saturating_sub(state.samples.len());
            let skip = samples.len().saturating_sub(room);
            state.dropped += skip as u64;
            for sample in samples.into_iter().skip(skip).rev() {
                state.samples.push_front(sample);
            }
        }
        self.available.notify_all();
        self.notify_listener();
    }

    /// Discards every buffered sample and returns how many were discarded.
    pub fn flush(&self) -> usize {
        let mut state = lock_or_recover(&self.state, "consumer queue");
        let n = state.samples.len();
        state.samples.clear();
        n
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.state, "consumer queue").samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total samples discarded by overflow since creation.
    pub fn dropped(&self) -> u64 {
        lock_or_recover(&self.state, "consumer queue").dropped
    }

    /// Wakes every blocked [`pop`](Self::pop) with [`PopResult::Interrupted`].
    pub fn interrupt(&self) {
        lock_or_recover(&self.state, "consumer queue").interrupts += 1;
        self.available.notify_all();
        self.notify_listener();
    }
}

impl Cancellable for ConsumerQueue {
    fn cancel(&self) {
        self.interrupt();
    }
}

impl std::fmt::Debug for ConsumerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::values::ChannelValues;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn sample(ts: f64) -> Sample {
        Sample::new(ts, ChannelValues::Float32(vec![ts as f32]), true)
    }

    #[test]
    fn test_overflow_keeps_newest_capacity_samples() {
        // Arrange
        let queue = ConsumerQueue::new(4);

        // Act
        for i in 0..10 {
            queue.push(sample(f64::from(i)));
        }

        // Assert
        let kept: Vec<f64> = queue.drain().iter().map(|s| s.timestamp).collect();
        assert_eq!(kept, vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(queue.dropped(), 6);
    }

    #[test]
    fn test_push_many_reports_dropped_count() {
        let queue = ConsumerQueue::new(3);

        let dropped = queue.push_many((0..5).map(|i| sample(f64::from(i))));

        assert_eq!(dropped, 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_times_out_on_empty_queue() {
        // Arrange
        let queue = ConsumerQueue::new(8);
        let start = Instant::now();

        // Act
        let result = queue.pop(Duration::from_millis(30));

        // Assert
        assert_eq!(result, PopResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_wakes_on_push_from_other_thread() {
        // Arrange
        let queue = Arc::new(ConsumerQueue::new(8));
        let writer = Arc::clone(&queue);

        // Act
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.push(sample(1.5));
        });
        let result = queue.pop(Duration::from_secs(5));
        handle.join().expect("writer panicked");

        // Assert
        assert_eq!(result, PopResult::Sample(sample(1.5)));
    }

    #[test]
    fn test_interrupt_wakes_blocked_pop() {
        // Arrange
        let queue = Arc::new(ConsumerQueue::new(8));
        let canceller = Arc::clone(&queue);

        // Act
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let result = queue.pop(Duration::from_secs(10));
        handle.join().expect("canceller panicked");

        // Assert
        assert_eq!(result, PopResult::Interrupted);
    }

    #[test]
    fn test_unread_restores_samples_ahead_of_newer_ones() {
        // Arrange
        let queue = ConsumerQueue::new(10);
        queue.push_many([sample(1.0), sample(2.0), sample(3.0)]);
        let taken = queue.drain();
        queue.push(sample(4.0));

        // Act
        queue.unread(taken);

        // Assert
        let order: Vec<f64> = queue.drain().iter().map(|s| s.timestamp).collect();
        assert_eq!(order, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unread_into_full_queue_drops_oldest_returned() {
        // Arrange
        let queue = ConsumerQueue::new(3);
        queue.push_many([sample(1.0), sample(2.0)]);
        let taken = queue.drain();
        queue.push_many([sample(3.0), sample(4.0)]);

        // Act
        queue.unread(taken);

        // Assert
        let order: Vec<f64> = queue.drain().iter().map(|s| s.timestamp).collect();
        assert_eq!(order, vec![2.0, 3.0, 4.0]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_flush_discards_buffered_samples() {
        let queue = ConsumerQueue::new(8);
        queue.push(sample(1.0));
        queue.push(sample(2.0));

        assert_eq!(queue.flush(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drain_up_to_preserves_order() {
        let queue = ConsumerQueue::new(8);
        queue.push_many((0..5).map(|i| sample(f64::from(i))));

        let first: Vec<f64> = queue.drain_up_to(2).iter().map(|s| s.timestamp).collect();

        assert_eq!(first, vec![0.0, 1.0]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_listener_runs_on_every_push() {
        // Arrange
        let queue = ConsumerQueue::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        queue.set_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Act
        queue.push(sample(1.0));
        queue.push_many(vec![sample(2.0), sample(3.0)]);
        queue.clear_listener();
        queue.push(sample(4.0));

        // Assert
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let queue = ConsumerQueue::new(0);
        queue.push(sample(1.0));
        queue.push(sample(2.0));

        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.try_pop().map(|s| s.timestamp), Some(2.0));
    }
}
