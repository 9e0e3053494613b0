//! Clocks, clock synchronization and timestamp post-processing.

pub mod clock;
pub mod clocksync;
pub mod postprocess;

pub use clock::{local_clock, Clock, LocalClock};
pub use clocksync::{ClockEstimate, ClockSyncEstimator, TimeProbeResult};
pub use postprocess::{ProcessingFlags, TimeCorrection, TimePostprocessor, FIRST_OFFSET_WAIT};
