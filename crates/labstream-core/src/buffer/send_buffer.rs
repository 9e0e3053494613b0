//! Fan-out of pushed samples to every connected consumer.
//!
//! The outlet pushes into one [`SendBuffer`]; each data session owns a
//! [`Consumer`] with its own bounded [`ConsumerQueue`].  A push appends the
//! sample to every queue under the buffer lock, so all consumers observe the
//! same order and the same sequence numbers, while a slow consumer only
//! loses its own oldest samples.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::consumer_queue::ConsumerQueue;
use crate::cancellation::registry::{lock_or_recover, Cancellable};
use crate::domain::sample::Sample;
use crate::protocol::sequence::SequenceCounter;

#[derive(Default)]
struct ConsumerSet {
    next_id: u64,
    consumers: Vec<(u64, Arc<ConsumerQueue>)>,
    interrupts: u64,
}

/// The producer side of an outlet's sample flow.
pub struct SendBuffer {
    max_capacity: usize,
    consumers: Mutex<ConsumerSet>,
    changed: Condvar,
    sequence: SequenceCounter,
}

impl SendBuffer {
    /// Creates a buffer whose consumers hold at most `max_capacity` samples.
    pub fn new(max_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            max_capacity: max_capacity.max(1),
            consumers: Mutex::new(ConsumerSet::default()),
            changed: Condvar::new(),
            sequence: SequenceCounter::new(),
        })
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Registers a new consumer.
    ///
    /// `max_buffered` is clamped to the buffer's capacity; 0 means "use the
    /// capacity".  The consumer sees only samples pushed after this call.
    pub fn new_consumer(self: &Arc<Self>, max_buffered: usize) -> Consumer {
        let capacity = match max_buffered {
            0 => self.max_capacity,
            n => n.min(self.max_capacity),
        };
        let queue = Arc::new(ConsumerQueue::new(capacity));
        let id = {
            let mut set = lock_or_recover(&self.consumers, "send buffer");
            let id = set.next_id;
            set.next_id += 1;
            set.consumers.push((id, Arc::clone(&queue)));
            id
        };
        self.changed.notify_all();
        debug!("send buffer consumer {id} registered (capacity {capacity})");
        Consumer {
            id,
            queue,
            buffer: Arc::downgrade(self),
        }
    }

    fn remove_consumer(&self, id: u64) {
        {
            let mut set = lock_or_recover(&self.consumers, "send buffer");
            set.consumers.retain(|(cid, _)| *cid != id);
        }
        self.changed.notify_all();
        debug!("send buffer consumer {id} unregistered");
    }

    /// Numbers `sample` and hands it to every consumer.
    pub fn push_sample(&self, mut sample: Sample) {
        let set = lock_or_recover(&self.consumers, "send buffer");
        sample.sequence = self.sequence.next();
        match set.consumers.split_last() {
            None => {}
            Some(((_, last), rest)) => {
                for (_, queue) in rest {
                    queue.push(sample.clone());
                }
                last.push(sample);
            }
        }
    }

    /// Numbers and hands out a chunk as one unit: no consumer sees a sample
    /// of another push between two samples of this chunk.
    pub fn push_chunk(&self, mut samples: Vec<Sample>) {
        if samples.is_empty() {
            return;
        }
        let set = lock_or_recover(&self.consumers, "send buffer");
        let first = self.sequence.reserve(samples.len() as u64);
        for (i, sample) in samples.iter_mut().enumerate() {
            sample.sequence = first.wrapping_add(i as u64);
        }
        for (_, queue) in &set.consumers {
            queue.push_many(samples.iter().cloned());
        }
    }

    /// Sequence number the next pushed sample will get.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.current()
    }

    pub fn consumer_count(&self) -> usize {
        lock_or_recover(&self.consumers, "send buffer").consumers.len()
    }

    pub fn have_consumers(&self) -> bool {
        self.consumer_count() > 0
    }

    /// Blocks until at least one consumer is connected, `timeout` passes or
    /// the buffer is interrupted.  Returns whether a consumer is connected.
    pub fn wait_for_consumers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut set = lock_or_recover(&self.consumers, "send buffer");
        let epoch = set.interrupts;
        loop {
            if !set.consumers.is_empty() {
                return true;
            }
            if set.interrupts != epoch {
                return false;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    deadline - now
                }
                None => Duration::from_secs(3600),
            };
            set = self
                .changed
                .wait_timeout(set, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Wakes every [`wait_for_consumers`](Self::wait_for_consumers) call and
    /// every consumer blocked in a pop.
    pub fn interrupt(&self) {
        let queues: Vec<Arc<ConsumerQueue>> = {
            let mut set = lock_or_recover(&self.consumers, "send buffer");
            set.interrupts += 1;
            set.consumers.iter().map(|(_, q)| Arc::clone(q)).collect()
        };
        self.changed.notify_all();
        for queue in queues {
            queue.interrupt();
        }
    }
}

impl Cancellable for SendBuffer {
    fn cancel(&self) {
        self.interrupt();
    }
}

/// One consumer's view of a [`SendBuffer`].  Unregisters on drop.
pub struct Consumer {
    id: u64,
    queue: Arc<ConsumerQueue>,
    buffer: Weak<SendBuffer>,
}

impl Consumer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The consumer's queue.
    pub fn queue(&self) -> &Arc<ConsumerQueue> {
        &self.queue
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.remove_consumer(self.id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
