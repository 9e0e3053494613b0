//! The local clock every timestamp in this crate is expressed in.
//!
//! `local_clock()` returns seconds as `f64`.  It is monotonic: it advances
//! with [`Instant`] and never jumps when the wall clock is adjusted.  Its
//! zero point is the wall-clock time at which the process first read it,
//! so two processes on one host read nearly the same value and
//! processes on different hosts differ by an offset that
//! [`clocksync`](crate::time::clocksync) estimates.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct Epoch {
    instant: Instant,
    wall_secs: f64,
}

static EPOCH: OnceLock<Epoch> = OnceLock::new();

/// Current time on the local clock, in seconds.
pub fn local_clock() -> f64 {
    let epoch = EPOCH.get_or_init(|| Epoch {
        instant: Instant::now(),
        wall_secs: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    });
    epoch.wall_secs + epoch.instant.elapsed().as_secs_f64()
}

/// A source of local-clock readings.
///
/// Components that age data out or throttle work take a `Clock` instead of
/// calling [`local_clock`] directly so tests can script time.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current time in seconds.
    fn now(&self) -> f64;
}

/// The real [`local_clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> f64 {
        local_clock()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_clock_is_monotonic() {
        // Arrange
        let mut previous = local_clock();

        // Act / Assert
        for _ in 0..1000 {
            let now = local_clock();
            assert!(now >= previous, "clock went backwards: {previous} -> {now}");
            previous = now;
        }
    }

    #[test]
    fn test_local_clock_advances_with_real_time() {
        let before = LocalClock.now();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let after = LocalClock.now();

        assert!(after - before >= 0.015, "elapsed {}", after - before);
    }
}
