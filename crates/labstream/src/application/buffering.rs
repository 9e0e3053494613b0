//! Buffer sizing shared by outlets and inlets.

use labstream_core::IRREGULAR_RATE;

/// Samples assumed per second when sizing buffers of irregular streams.
const IRREGULAR_SAMPLES_PER_SECOND: f64 = 100.0;

/// How much data a buffer holds before dropping the oldest samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferSize {
    /// Enough for this many seconds at the stream's nominal rate (100 Hz
    /// for irregular streams).
    Seconds(f64),
    /// An exact sample count.
    Samples(usize),
}

impl Default for BufferSize {
    /// Six minutes.
    fn default() -> Self {
        BufferSize::Seconds(360.0)
    }
}

impl BufferSize {
    /// The capacity in samples for a stream of `srate`.
    ///
    /// Durations are never sized below `reserve_samples` nor below
    /// `reserve_ms` of data; explicit sample counts are taken as given.
    pub fn to_samples(self, srate: f64, reserve_ms: u32, reserve_samples: u32) -> usize {
        match self {
            BufferSize::Samples(n) => n.max(1),
            BufferSize::Seconds(seconds) => {
                let rate = if srate == IRREGULAR_RATE {
                    IRREGULAR_SAMPLES_PER_SECOND
                } else {
                    srate
                };
                let wanted = (seconds.max(0.0) * rate).ceil();
                let reserve = (f64::from(reserve_ms) / 1000.0 * rate).ceil();
                let samples = wanted.max(reserve).min(usize::MAX as f64) as usize;
                samples.max(reserve_samples as usize).max(1)
            }
        }
    }

    /// The capacity as the `u32` carried in feed requests.
    pub fn to_wire(self, srate: f64, reserve_ms: u32, reserve_samples: u32) -> u32 {
        u32::try_from(self.to_samples(srate, reserve_ms, reserve_samples)).unwrap_or(u32::MAX)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
