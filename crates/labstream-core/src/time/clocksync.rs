//! Clock offset estimation from round-trip probes.
//!
//! # The four timestamps (for beginners)
//!
//! An inlet sends a probe at local time `t0`.  The outlet stamps its own
//! clock on receipt (`t1`) and again when replying (`t2`).  The reply
//! arrives back at local time `t3`.
//!
//! ```text
//! inlet   t0 ──────────────►            ◄────────────── t3
//! outlet              t1 ─(processing)─ t2
//! ```
//!
//! - Round-trip time excluding the outlet's processing: `(t3 - t0) - (t2 - t1)`.
//! - Assuming the path is equally slow in both directions, the outlet's
//!   clock is ahead of ours by `((t1 - t0) + (t2 - t3)) / 2`.
//!
//! Queuing delay rarely hits both directions equally, so probes with a large
//! round-trip carry the most asymmetry.  The estimator keeps only the probes
//! with the smallest round-trips and averages those.

/// One completed probe exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeProbeResult {
    /// Local send time.
    pub t0: f64,
    /// Remote receipt time.
    pub t1: f64,
    /// Remote reply time.
    pub t2: f64,
    /// Local receipt time.
    pub t3: f64,
}

impl TimeProbeResult {
    /// Network round-trip time, excluding the remote's processing time.
    pub fn rtt(&self) -> f64 {
        (self.t3 - self.t0) - (self.t2 - self.t1)
    }

    /// How far the remote clock is ahead of the local clock.
    pub fn remote_minus_local(&self) -> f64 {
        ((self.t1 - self.t0) + (self.t2 - self.t3)) / 2.0
    }
}

/// The result of a clock synchronization run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    /// Value to add to a remote timestamp to express it on the local clock.
    pub offset: f64,
    /// The remote clock's reading at the best probe.
    pub remote_time: f64,
    /// Bound on the error of `offset`, in seconds.
    ///
    /// Half the largest retained round-trip plus half the spread of the
    /// retained offsets; grows with both latency and jitter.
    pub uncertainty: f64,
    pub probes_used: usize,
}

/// Accumulates probe results and derives a [`ClockEstimate`].
#[derive(Debug, Clone)]
pub struct ClockSyncEstimator {
    keep: usize,
    probes: Vec<TimeProbeResult>,
}

impl ClockSyncEstimator {
    /// `keep` is the size of the minimum-round-trip subset (at least one).
    pub fn new(keep: usize) -> Self {
        Self {
            keep: keep.max(1),
            probes: Vec::new(),
        }
    }

    /// Records a probe.  Probes with a negative or non-finite round-trip
    /// are ignored.
    pub fn add(&mut self, probe: TimeProbeResult) -> bool {
        let rtt = probe.rtt();
        if !rtt.is_finite() || rtt < 0.0 {
            return false;
        }
        self.probes.push(probe);
        true
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn clear(&mut self) {
        self.probes.clear();
    }

    /// Derives an estimate, or `None` with fewer than `min_probes` probes.
    pub fn estimate(&self, min_probes: usize) -> Option<ClockEstimate> {
        if self.probes.is_empty() || self.probes.len() < min_probes {
            return None;
        }
        let mut ranked = self.probes.clone();
        ranked.sort_by(|a, b| a.rtt().total_cmp(&b.rtt()));
        ranked.truncate(self.keep);

        let offsets: Vec<f64> = ranked.iter().map(TimeProbeResult::remote_minus_local).collect();
        let mean = offsets.iter().sum::<f64>() / offsets.len() as f64;
        let spread = offsets.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            - offsets.iter().copied().fold(f64::INFINITY, f64::min);
        let max_rtt = ranked.iter().map(TimeProbeResult::rtt).fold(0.0, f64::max);

        let best = &ranked[0];
        Some(ClockEstimate {
            offset: -mean,
            remote_time: (best.t1 + best.t2) / 2.0,
            uncertainty: max_rtt / 2.0 + spread / 2.0,
            probes_used: ranked.len(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
