//! Receiving a stream: [`StreamInlet`].
//!
//! An inlet talks to its outlet over three independent channels:
//!
//! | Channel | Transport | Used by                                      |
//! |---------|-----------|----------------------------------------------|
//! | data    | TCP       | `open_stream`, `pull_sample`, `pull_chunk`   |
//! | info    | TCP       | `info`                                       |
//! | time    | UDP       | `time_correction`, timestamp post-processing |
//!
//! The data feed starts on [`StreamInlet::open_stream`] or lazily on the
//! first pull and fills a bounded local queue in the background.  When the
//! queue is full the oldest samples are dropped, mirroring the outlet.
//!
//! # When the outlet goes away
//!
//! The first channel to notice marks the connection lost.  Every blocked
//! call wakes up and every call from then on fails with
//! [`StreamError::ConnectionLost`].  An inlet never reconnects by itself;
//! resolve the stream again and create a new inlet.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use labstream_core::cancellation::{Cancellable, CancellableOperation, WaitOutcome, WaitSlot};
use labstream_core::protocol::messages::TransportMode;
use labstream_core::time::{Clock, LocalClock, TimePostprocessor, FIRST_OFFSET_WAIT};
use labstream_core::{ClockEstimate, ConsumerQueue, PopResult, ProcessingFlags, Sample, SampleValue, StreamInfo};
use tokio::sync::watch;
use tracing::debug;

use crate::application::buffering::BufferSize;
use crate::error::{record, Result, StreamError};
use crate::infrastructure::config::ApiConfig;
use crate::infrastructure::network::data_receiver::{self, FeedParams, FeedState};
use crate::infrastructure::network::info_receiver;
use crate::infrastructure::network::inlet_connection::InletConnection;
use crate::infrastructure::network::time_receiver::TimeReceiver;
use crate::infrastructure::runtime::{deadline_after, Interrupted, IoRuntime};

/// Longest single wait inside a blocking pull, so a loss that raced the
/// start of the wait is still noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// How an inlet buffers and what it does to timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InletOptions {
    /// Local buffer before the oldest samples are dropped.  Also sent to the
    /// outlet as the size of its per-inlet queue.
    pub max_buffered: BufferSize,
    /// Largest batch the outlet may send; 0 lets the outlet decide.
    pub max_chunklen: u32,
    pub transport: TransportMode,
    pub processing: ProcessingFlags,
}

impl Default for InletOptions {
    fn default() -> Self {
        Self {
            max_buffered: BufferSize::default(),
            max_chunklen: 0,
            transport: TransportMode::Chunked,
            processing: ProcessingFlags::default(),
        }
    }
}

/// One running data feed.
struct Feed {
    stop: watch::Sender<bool>,
    state: Arc<WaitSlot<FeedState>>,
    _lost_tie: CancellableOperation,
}

struct PostState {
    processor: TimePostprocessor,
    next_sequence: Option<u64>,
}

/// A connection to one outlet.
pub struct StreamInlet {
    conn: Arc<InletConnection>,
    params: FeedParams,
    clock: Arc<dyn Clock>,
    queue: Arc<ConsumerQueue>,
    feed: Mutex<Option<Feed>>,
    time: TimeReceiver,
    post: Mutex<PostState>,
    shutdown: watch::Sender<bool>,
    _queue_tie: CancellableOperation,
    runtime: IoRuntime,
}

impl StreamInlet {
    /// Creates an inlet for a resolved stream with the process configuration.
    ///
    /// Nothing is connected yet.
    ///
    /// # Errors
    ///
    /// [`StreamError::Configuration`] when `info` advertises no usable
    /// endpoint.  The message is also stored for
    /// [`last_error`](crate::last_error).
    pub fn new(info: StreamInfo, options: InletOptions) -> Result<Self> {
        Self::with_config(info, options, ApiConfig::shared())
    }

    /// Creates an inlet with an explicit configuration.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_config(info: StreamInfo, options: InletOptions, config: Arc<ApiConfig>) -> Result<Self> {
        let tuning = config.tuning.clone();
        let conn = Arc::new(InletConnection::new(info, config).map_err(record)?);
        let runtime = IoRuntime::new("inlet").map_err(record)?;
        let clock: Arc<dyn Clock> = Arc::new(LocalClock);

        let srate = conn.info().nominal_srate();
        let capacity = options.max_buffered.to_samples(
            srate,
            tuning.inlet_buffer_reserve_ms,
            tuning.inlet_buffer_reserve_samples,
        );
        let queue = Arc::new(ConsumerQueue::new(capacity));
        let queue_tie = conn.watch(Arc::clone(&queue) as Arc<dyn Cancellable>);
        let params = FeedParams {
            max_buflen: options.max_buffered.to_wire(
                srate,
                tuning.inlet_buffer_reserve_ms,
                tuning.inlet_buffer_reserve_samples,
            ),
            max_chunklen: options.max_chunklen,
            transport: options.transport,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let time = TimeReceiver::new(
            Arc::clone(&conn),
            Arc::clone(&clock),
            runtime.handle().clone(),
            shutdown_rx,
        );
        let processor = TimePostprocessor::new(
            options.processing,
            tuning.smoothing_halftime,
            srate,
            Arc::clone(&clock),
        );

        Ok(Self {
            conn,
            params,
            clock,
            queue,
            feed: Mutex::new(None),
            time,
            post: Mutex::new(PostState {
                processor,
                next_sequence: None,
            }),
            shutdown,
            _queue_tie: queue_tie,
            runtime,
        })
    }

    // ── Stream control ────────────────────────────────────────────────────────

    /// Connects the data feed and waits until it delivers.
    ///
    /// # Errors
    ///
    /// [`StreamError::TimeoutExpired`] when the handshake did not finish in
    /// time, [`StreamError::ConnectionLost`] when the outlet is gone, and
    /// [`StreamError::Configuration`] when the outlet refused the feed.
    pub fn open_stream(&self, timeout: Duration) -> Result<()> {
        self.conn.check()?;
        let state = self.ensure_feed();
        match state.wait_until(deadline_after(timeout), FeedState::is_settled) {
            WaitOutcome::Ready => match state.get() {
                FeedState::Failed(_) if self.conn.is_lost() => Err(self.conn.lost_error()),
                FeedState::Failed(reason) => Err(StreamError::Configuration(reason)),
                _ => Ok(()),
            },
            WaitOutcome::TimedOut => Err(StreamError::TimeoutExpired {
                operation: "open_stream",
            }),
            WaitOutcome::Cancelled => Err(self.conn.lost_error()),
        }
    }

    /// Disconnects the data feed.  Buffered samples stay available; a later
    /// pull or [`open_stream`](Self::open_stream) reconnects.
    pub fn close_stream(&self) {
        if let Some(feed) = self.lock_feed().take() {
            let _ = feed.stop.send(true);
            debug!("closed data feed of {}", self.conn.info().name());
        }
        self.lock_post().next_sequence = None;
        self.time.reset();
    }

    fn ensure_feed(&self) -> Arc<WaitSlot<FeedState>> {
        let mut feed = self.lock_feed();
        if let Some(running) = feed.as_ref() {
            if !matches!(running.state.get(), FeedState::Failed(_)) {
                return Arc::clone(&running.state);
            }
        }

        let state = Arc::new(WaitSlot::new(FeedState::Connecting));
        let tie = self.conn.watch(Arc::clone(&state) as Arc<dyn Cancellable>);
        let (stop, stop_rx) = watch::channel(false);
        self.runtime.spawn(data_receiver::run(
            Arc::clone(&self.conn),
            self.params,
            Arc::clone(&self.queue),
            Arc::clone(&state),
            Arc::clone(&self.clock),
            stop_rx,
        ));
        *feed = Some(Feed {
            stop,
            state: Arc::clone(&state),
            _lost_tie: tie,
        });
        state
    }

    /// The refusal message of the current feed, if the outlet refused it.
    fn feed_refusal(&self) -> Option<String> {
        self.lock_feed().as_ref().and_then(|feed| match feed.state.get() {
            FeedState::Failed(reason) => Some(reason),
            _ => None,
        })
    }

    // ── Pulling ───────────────────────────────────────────────────────────────

    /// Takes the oldest buffered sample, waiting up to `timeout` for one.
    ///
    /// Returns `Ok(None)` when the wait ran out.  The timestamp has the
    /// enabled post-processing applied (by default: clock correction).  The
    /// first clock-corrected sample also waits up to five seconds for the
    /// first clock offset.
    ///
    /// # Errors
    ///
    /// [`StreamError::ConnectionLost`] once the outlet is gone,
    /// [`StreamError::Configuration`] when the outlet refused the feed,
    /// [`StreamError::TimeoutExpired`] when no clock offset arrived for the
    /// first corrected sample and [`StreamError::Value`] when the values do
    /// not convert to `T`.  A sample that failed to deliver stays buffered.
    pub fn pull_sample<T: SampleValue>(&self, timeout: Duration) -> Result<Option<(Vec<T>, f64)>> {
        self.conn.check()?;
        self.ensure_feed();
        let deadline = deadline_after(timeout);

        loop {
            let slice = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_SLICE),
                None => POLL_SLICE,
            };
            match self.queue.pop(slice) {
                PopResult::Sample(sample) => {
                    let (values, timestamps) = self.deliver(vec![sample])?;
                    return Ok(values.into_iter().zip(timestamps).next());
                }
                PopResult::Interrupted | PopResult::TimedOut => {
                    self.conn.check()?;
                    if let Some(reason) = self.feed_refusal() {
                        return Err(StreamError::Configuration(reason));
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Takes every buffered sample without waiting.
    ///
    /// This never waits for data, not even right after the first pull
    /// opened the feed lazily: an empty chunk only means nothing has arrived
    /// yet.  Call
    /// [`open_stream`](Self::open_stream) first to be sure the feed runs.
    ///
    /// # Errors
    ///
    /// As [`pull_sample`](Self::pull_sample).  On error the whole chunk stays
    /// buffered.
    pub fn pull_chunk<T: SampleValue>(&self) -> Result<(Vec<Vec<T>>, Vec<f64>)> {
        self.conn.check()?;
        self.ensure_feed();
        let samples = self.queue.drain();
        if samples.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        self.deliver(samples)
    }

    /// Like [`pull_chunk`](Self::pull_chunk) but with all values in one
    /// channel-interleaved buffer.
    ///
    /// # Errors
    ///
    /// As [`pull_sample`](Self::pull_sample).
    pub fn pull_chunk_multiplexed<T: SampleValue>(&self) -> Result<(Vec<T>, Vec<f64>)> {
        let (samples, timestamps) = self.pull_chunk::<T>()?;
        Ok((samples.into_iter().flatten().collect(), timestamps))
    }

    /// Number of samples buffered locally.
    pub fn samples_available(&self) -> usize {
        self.queue.len()
    }

    /// Discards every buffered sample; returns how many were discarded.
    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    /// Converts and post-processes taken samples.  Nothing is committed
    /// unless every sample converts; otherwise they go back to the queue.
    fn deliver<T: SampleValue>(&self, samples: Vec<Sample>) -> Result<(Vec<Vec<T>>, Vec<f64>)> {
        if self.lock_post().processor.awaits_offset() {
            if let Err(e) = self.time.time_correction(FIRST_OFFSET_WAIT) {
                self.queue.unread(samples);
                return Err(e);
            }
        }

        let mut values = Vec::with_capacity(samples.len());
        for sample in &samples {
            match T::from_values(sample.values.clone()) {
                Ok(converted) => values.push(converted),
                Err(e) => {
                    self.queue.unread(samples);
                    return Err(e.into());
                }
            }
        }

        let mut post = self.lock_post();
        let timestamps = samples
            .iter()
            .map(|sample| {
                if let Some(expected) = post.next_sequence {
                    if sample.sequence > expected {
                        post.processor.skip_samples(sample.sequence - expected);
                    }
                }
                post.next_sequence = Some(sample.sequence.wrapping_add(1));
                post.processor.process(sample.timestamp, &self.time)
            })
            .collect();
        Ok((values, timestamps))
    }

    // ── Time ──────────────────────────────────────────────────────────────────

    /// The value to add to this stream's timestamps to map them onto the
    /// local clock.
    ///
    /// # Errors
    ///
    /// [`StreamError::TimeoutExpired`] when no estimate arrived in time and
    /// [`StreamError::ConnectionLost`] once the outlet is gone.
    pub fn time_correction(&self, timeout: Duration) -> Result<f64> {
        Ok(self.time_correction_ex(timeout)?.offset)
    }

    /// [`time_correction`](Self::time_correction) with the remote time and
    /// the uncertainty of the estimate.
    ///
    /// # Errors
    ///
    /// As [`time_correction`](Self::time_correction).
    pub fn time_correction_ex(&self, timeout: Duration) -> Result<ClockEstimate> {
        self.time.time_correction(timeout)
    }

    /// Changes the timestamp post-processing.
    pub fn set_postprocessing(&self, flags: ProcessingFlags) {
        self.lock_post().processor.set_flags(flags);
    }

    pub fn postprocessing(&self) -> ProcessingFlags {
        self.lock_post().processor.flags()
    }

    // ── Descriptor ────────────────────────────────────────────────────────────

    /// Fetches the outlet's full descriptor, description tree included.
    ///
    /// # Errors
    ///
    /// [`StreamError::TimeoutExpired`] or [`StreamError::ConnectionLost`].
    pub fn info(&self, timeout: Duration) -> Result<StreamInfo> {
        self.conn.check()?;
        let conn = Arc::clone(&self.conn);
        let clock = Arc::clone(&self.clock);
        let fetched = self.runtime.call(
            async move { info_receiver::fetch(&conn, clock.as_ref()).await },
            deadline_after(timeout),
            &self.conn.lost_handle(),
        );
        match fetched {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(StreamError::ConnectionLost(reason))) => {
                self.conn.mark_lost(reason);
                Err(self.conn.lost_error())
            }
            Ok(Err(e)) => Err(e),
            Err(Interrupted::TimedOut) => Err(StreamError::TimeoutExpired { operation: "info" }),
            Err(Interrupted::Cancelled) => Err(self.conn.lost_error()),
        }
    }

    /// The descriptor this inlet was created from.
    pub fn resolved_info(&self) -> &StreamInfo {
        self.conn.info()
    }

    /// Whether the outlet is known to be gone.
    pub fn is_lost(&self) -> bool {
        self.conn.is_lost()
    }

    fn lock_feed(&self) -> MutexGuard<'_, Option<Feed>> {
        self.feed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_post(&self) -> MutexGuard<'_, PostState> {
        self.post.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StreamInlet {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(feed) = self.lock_feed().take() {
            let _ = feed.stop.send(true);
        }
        self.queue.interrupt();
    }
}

impl std::fmt::Debug for StreamInlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInlet")
            .field("conn", &self.conn)
            .field("buffered", &self.queue.len())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
