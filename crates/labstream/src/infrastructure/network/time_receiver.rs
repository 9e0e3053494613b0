//! Clock offset estimation against one outlet.
//!
//! Time probes travel over UDP to the outlet's service socket, separate from
//! the TCP data connection, so a busy data feed never delays them and a
//! running sync never delays a pull.
//!
//! # Waves
//!
//! One *wave* sends `time_probe_count` probes spaced `time_probe_interval`
//! apart and listens for replies until `time_probe_max_rtt` after the last
//! send.  Replies from older waves are ignored by wave id.  A wave yields an
//! estimate once at least `time_update_min_probes` replies came back; only
//! the `time_probe_keep` fastest round-trips are averaged.
//!
//! The first [`TimeReceiver::time_correction`] (or the first timestamp that
//! needs correcting) starts a background loop that repeats the wave every
//! `time_update_interval`, so later calls answer from the latest estimate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use labstream_core::cancellation::{Cancellable, CancellableOperation, WaitOutcome, WaitSlot};
use labstream_core::protocol::codec::{decode_message, encode_message};
use labstream_core::protocol::messages::TimeProbe;
use labstream_core::time::{
    Clock, ClockEstimate, ClockSyncEstimator, TimeCorrection, TimeProbeResult,
};
use labstream_core::WireMessage;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Result, StreamError};
use crate::infrastructure::config::TuningConfig;
use crate::infrastructure::network::framing::timestamp_us;
use crate::infrastructure::network::inlet_connection::InletConnection;
use crate::infrastructure::network::sockets::IpFamily;
use crate::infrastructure::runtime::seconds;

/// Largest reply datagram accepted.
const MAX_REPLY: usize = 1024;

#[derive(Debug, Default)]
struct TimeState {
    estimate: Option<ClockEstimate>,
    started: bool,
    reset_pending: bool,
}

/// Per-inlet clock synchronization.
pub struct TimeReceiver {
    conn: Arc<InletConnection>,
    tuning: TuningConfig,
    clock: Arc<dyn Clock>,
    state: Arc<WaitSlot<TimeState>>,
    runtime: Handle,
    shutdown: watch::Receiver<bool>,
    _lost_tie: CancellableOperation,
}

impl TimeReceiver {
    /// Creates the receiver; nothing is sent until the first request.
    pub fn new(
        conn: Arc<InletConnection>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let tuning = conn.config().tuning.clone();
        let state = Arc::new(WaitSlot::new(TimeState::default()));
        let lost_tie = conn.watch(Arc::clone(&state) as Arc<dyn Cancellable>);
        Self {
            conn,
            tuning,
            clock,
            state,
            runtime,
            shutdown,
            _lost_tie: lost_tie,
        }
    }

    /// Blocks until an estimate is available or `timeout` passes.
    ///
    /// # Errors
    ///
    /// [`StreamError::TimeoutExpired`] when no wave completed in time and
    /// [`StreamError::ConnectionLost`] once the outlet is gone.
    pub fn time_correction(&self, timeout: Duration) -> Result<ClockEstimate> {
        self.conn.check()?;
        self.ensure_started();
        let deadline = Instant::now().checked_add(timeout);
        match self.state.wait_until(deadline, |s| s.estimate.is_some()) {
            WaitOutcome::Ready => self
                .state
                .with(|s| s.estimate)
                .ok_or(StreamError::TimeoutExpired {
                    operation: "time correction",
                }),
            WaitOutcome::TimedOut => Err(StreamError::TimeoutExpired {
                operation: "time correction",
            }),
            WaitOutcome::Cancelled => Err(self.conn.lost_error()),
        }
    }

    /// The latest estimate without waiting.
    pub fn latest(&self) -> Option<ClockEstimate> {
        self.state.with(|s| s.estimate)
    }

    /// Flags a discontinuity for [`TimeCorrection::take_reset`] so the
    /// post-processor restarts its smoothing.  Called when the data feed is
    /// reopened.
    pub fn reset(&self) {
        self.state.update(|s| {
            if s.estimate.is_some() {
                s.reset_pending = true;
            }
        });
    }

    fn ensure_started(&self) {
        let start = self.state.update(|s| !std::mem::replace(&mut s.started, true));
        if !start {
            return;
        }
        debug!("starting time sync with {}", self.conn.service_addr());
        self.runtime.spawn(sync_loop(
            self.conn.service_addr(),
            self.tuning.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.state),
            self.shutdown.clone(),
        ));
    }
}

impl TimeCorrection for TimeReceiver {
    fn current_offset(&self) -> Option<f64> {
        if self.conn.is_lost() {
            return self.latest().map(|e| e.offset);
        }
        self.ensure_started();
        self.latest().map(|e| e.offset)
    }

    fn wait_offset(&self, timeout: Duration) -> Option<f64> {
        match self.time_correction(timeout) {
            Ok(estimate) => Some(estimate.offset),
            Err(e) => {
                debug!("no clock offset for {}: {e}", self.conn.info().name());
                self.latest().map(|e| e.offset)
            }
        }
    }

    fn take_reset(&self) -> bool {
        self.state.update(|s| std::mem::take(&mut s.reset_pending))
    }
}

async fn sync_loop(
    service: SocketAddr,
    tuning: TuningConfig,
    clock: Arc<dyn Clock>,
    state: Arc<WaitSlot<TimeState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let family = IpFamily::of(&service.ip());
    let socket = match bind_probe_socket(family, service).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("time sync with {service} unavailable: {e}");
            return;
        }
    };

    let mut wave_id: u32 = 0;
    loop {
        wave_id = wave_id.wrapping_add(1);
        let wave = tokio::select! {
            _ = shutdown.changed() => break,
            wave = probe_wave(&socket, wave_id, &tuning, clock.as_ref()) => wave,
        };

        let mut estimator = ClockSyncEstimator::new(tuning.time_probe_keep);
        for probe in wave {
            estimator.add(probe);
        }
        match estimator.estimate(tuning.time_update_min_probes) {
            Some(estimate) => {
                trace!(
                    "clock offset to {service}: {:.6} s (± {:.6} s)",
                    estimate.offset,
                    estimate.uncertainty
                );
                state.update(|s| s.estimate = Some(estimate));
            }
            None => debug!("time wave {wave_id} to {service} got too few replies"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(seconds(tuning.time_update_interval)) => {}
        }
    }
    debug!("time sync with {service} stopped");
}

async fn bind_probe_socket(family: IpFamily, service: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(family.unspecified(), 0)).await?;
    socket.connect(service).await?;
    Ok(socket)
}

/// Sends one wave of probes and collects the matching replies.
async fn probe_wave(
    socket: &UdpSocket,
    wave_id: u32,
    tuning: &TuningConfig,
    clock: &dyn Clock,
) -> Vec<TimeProbeResult> {
    let count = tuning.time_probe_count.max(1);
    let interval = seconds(tuning.time_probe_interval);
    let grace = seconds(tuning.time_probe_max_rtt);

    let mut results = Vec::with_capacity(count as usize);
    let mut sent = 0u32;
    let mut next_send = tokio::time::Instant::now();
    let mut end = next_send;
    let mut buf = [0u8; MAX_REPLY];

    loop {
        let sending = sent < count;
        tokio::select! {
            _ = tokio::time::sleep_until(next_send), if sending => {
                let probe = WireMessage::TimeProbe(TimeProbe { wave_id, t0: clock.now() });
                match encode_message(&probe, u64::from(sent), timestamp_us(clock)) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send(&bytes).await {
                            trace!("time probe send failed: {e}");
                        }
                    }
                    Err(e) => debug!("failed to encode time probe: {e}"),
                }
                sent += 1;
                next_send += interval;
                if sent == count {
                    end = tokio::time::Instant::now() + grace;
                }
            }
            _ = tokio::time::sleep_until(end), if !sending => break,
            received = socket.recv(&mut buf) => {
                let t3 = clock.now();
                let Ok(len) = received else {
                    // ICMP "port unreachable" from an earlier probe.
                    continue;
                };
                if let Ok((WireMessage::TimeReply(reply), _)) = decode_message(&buf[..len]) {
                    if reply.wave_id == wave_id {
                        results.push(TimeProbeResult {
                            t0: reply.t0,
                            t1: reply.t1,
                            t2: reply.t2,
                            t3,
                        });
                    }
                }
            }
        }
    }
    results
}

// ── Tests ─────────────────────────────────────────────────────────────────────
