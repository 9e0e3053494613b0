//! Post-processing of received timestamps.
//!
//! Inlets can rewrite incoming timestamps in three optional steps, applied
//! in this order:
//!
//! 1. **clocksync** – add the latest clock offset so remote timestamps read
//!    as local time.  The first sample waits (bounded) for an offset; after
//!    that the offset is re-queried every 50 samples, at most twice per
//!    second.
//! 2. **dejitter** – fit a line `t = w0 + w1 * n` through the sample index
//!    with recursive least squares and an exponential forgetting factor, so
//!    network and scheduling jitter are smoothed away for regular streams.
//! 3. **monotonize** – never let a timestamp go backwards.

use std::sync::Arc;
use std::time::Duration;

use crate::time::clock::Clock;

/// Samples between two clock offset queries.
const SAMPLES_BETWEEN_CLOCKSYNCS: u32 = 50;

/// Minimum seconds between two clock offset queries.
const MIN_QUERY_INTERVAL: f64 = 0.5;

/// Longest wait for the first clock offset of a stream.
pub const FIRST_OFFSET_WAIT: Duration = Duration::from_secs(5);

/// Which post-processing steps an inlet applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingFlags {
    pub clocksync: bool,
    pub dejitter: bool,
    pub monotonize: bool,
    /// Processing is serialized by the inlet either way; the flag is kept
    /// so callers can state the intent explicitly.
    pub threadsafe: bool,
}

impl ProcessingFlags {
    /// No post-processing: timestamps are delivered as sent.
    pub const NONE: ProcessingFlags = ProcessingFlags {
        clocksync: false,
        dejitter: false,
        monotonize: false,
        threadsafe: false,
    };

    /// Every step enabled.
    pub const ALL: ProcessingFlags = ProcessingFlags {
        clocksync: true,
        dejitter: true,
        monotonize: true,
        threadsafe: true,
    };

    pub fn is_none(&self) -> bool {
        !(self.clocksync || self.dejitter || self.monotonize)
    }
}

impl Default for ProcessingFlags {
    fn default() -> Self {
        Self {
            clocksync: true,
            ..Self::NONE
        }
    }
}

/// Source of clock offsets for the clocksync step.
#[cfg_attr(test, mockall::automock)]
pub trait TimeCorrection: Send + Sync {
    /// The latest offset to add to remote timestamps, if one is known yet.
    fn current_offset(&self) -> Option<f64>;

    /// Like [`current_offset`](Self::current_offset), but blocks up to
    /// `timeout` while no offset is known yet.
    fn wait_offset(&self, timeout: Duration) -> Option<f64>;

    /// `true` once after the remote clock was detected to have reset
    /// (e.g. the outlet restarted).
    fn take_reset(&self) -> bool;
}

/// Recursive-least-squares line fit over sample index.
#[derive(Debug, Clone)]
struct Dejitterer {
    t0: f64,
    samples_since_t0: f64,
    w0: f64,
    w1: f64,
    p00: f64,
    p01: f64,
    p11: f64,
    lambda: f64,
}

impl Dejitterer {
    fn new(t0: f64, srate: f64, halftime: f64) -> Self {
        let (w1, lambda) = if srate > 0.0 && halftime > 0.0 {
            (1.0 / srate, 2f64.powf(-1.0 / (srate * halftime)))
        } else {
            (0.0, 0.0)
        };
        Self {
            // Baseline removal keeps the regression numerically stable.
            t0: t0.trunc(),
            samples_since_t0: 0.0,
            w0: 0.0,
            w1,
            p00: 1e10,
            p01: 0.0,
            p11: 1e10,
            lambda,
        }
    }

    fn applicable(&self) -> bool {
        self.lambda > 0.0
    }

    fn dejitter(&mut self, t: f64) -> f64 {
        if !self.applicable() {
            return t;
        }
        let t = t - self.t0;
        let u1 = self.samples_since_t0;
        self.samples_since_t0 += 1.0;

        let pi0 = self.p00 + u1 * self.p01;
        let pi1 = self.p01 + u1 * self.p11;
        let err = t - (self.w0 + u1 * self.w1);
        let g_inv = 1.0 / (self.lambda + pi0 + pi1 * u1);
        let il = 1.0 / self.lambda;

        self.p00 = il * (self.p00 - pi0 * pi0 * g_inv);
        self.p01 = il * (self.p01 - pi0 * pi1 * g_inv);
        self.p11 = il * (self.p11 - pi1 * pi1 * g_inv);
        self.w0 += err * (self.p00 + self.p01 * u1);
        self.w1 += err * (self.p01 + self.p11 * u1);
        self.w0 + u1 * self.w1 + self.t0
    }
}

/// Applies the enabled [`ProcessingFlags`] steps to a timestamp stream.
pub struct TimePostprocessor {
    flags: ProcessingFlags,
    halftime: f64,
    srate: f64,
    clock: Arc<dyn Clock>,
    samples_since_query: u32,
    next_query_time: f64,
    last_offset: Option<f64>,
    last_value: f64,
    dejitter: Option<Dejitterer>,
}

impl TimePostprocessor {
    /// `halftime` is the dejitter smoothing half-time in seconds and
    /// `srate` the stream's nominal rate.
    pub fn new(flags: ProcessingFlags, halftime: f64, srate: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            flags,
            halftime,
            srate,
            clock,
            samples_since_query: SAMPLES_BETWEEN_CLOCKSYNCS,
            next_query_time: f64::NEG_INFINITY,
            last_offset: None,
            last_value: f64::NEG_INFINITY,
            dejitter: None,
        }
    }

    pub fn flags(&self) -> ProcessingFlags {
        self.flags
    }

    /// Changes the enabled steps.  Steps that were toggled start over.
    pub fn set_flags(&mut self, flags: ProcessingFlags) {
        if flags.dejitter != self.flags.dejitter {
            self.dejitter = None;
        }
        if flags.monotonize != self.flags.monotonize {
            self.last_value = f64::NEG_INFINITY;
        }
        self.flags = flags;
    }

    /// Tells the dejitterer that `n` samples were lost, so the regression
    /// index stays aligned with the sample count.
    pub fn skip_samples(&mut self, n: u64) {
        if let Some(d) = self.dejitter.as_mut().filter(|d| d.applicable()) {
            d.samples_since_t0 += n as f64;
        }
    }

    /// Processes one timestamp.
    pub fn process(&mut self, mut value: f64, correction: &dyn TimeCorrection) -> f64 {
        if self.flags.clocksync {
            self.samples_since_query = self.samples_since_query.saturating_add(1);
            let due = self.samples_since_query > SAMPLES_BETWEEN_CLOCKSYNCS
                && self.clock.now() > self.next_query_time;
            if due || self.last_offset.is_none() {
                self.refresh_offset(correction);
            }
            value += self.last_offset.unwrap_or(0.0);
        }

        if self.flags.dejitter {
            let (srate, halftime) = (self.srate, self.halftime);
            value = self
                .dejitter
                .get_or_insert_with(|| Dejitterer::new(value, srate, halftime))
                .dejitter(value);
        }

        if self.flags.monotonize {
            if value < self.last_value {
                value = self.last_value;
            } else {
                self.last_value = value;
            }
        }
        value
    }

    /// Whether the next clock-synced sample still has no offset to add.
    pub fn awaits_offset(&self) -> bool {
        self.flags.clocksync && self.last_offset.is_none()
    }

    fn refresh_offset(&mut self, correction: &dyn TimeCorrection) {
        let offset = match self.last_offset {
            None => correction.wait_offset(FIRST_OFFSET_WAIT),
            Some(_) => correction.current_offset(),
        };
        if offset.is_none() {
            return;
        }
        self.last_offset = offset;
        self.samples_since_query = 0;
        if correction.take_reset() {
            self.last_offset = correction.current_offset().or(offset);
            self.last_value = f64::NEG_INFINITY;
            self.dejitter = None;
        }
        self.next_query_time = self.clock.now() + MIN_QUERY_INTERVAL;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
