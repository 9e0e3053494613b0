//! Publishing a stream: [`StreamOutlet`].
//!
//! An outlet binds, per enabled IP family, a TCP data listener and a UDP
//! service socket in the configured port range, plus a multicast responder
//! on the shared multicast port.  The ports end up in the outlet's
//! descriptor, which is what discovery hands to inlets.
//!
//! # Pushing samples (for beginners)
//!
//! ```text
//! push_sample ──► SendBuffer ──► consumer queue ──► session task ──► TCP
//!                     │
//!                     └────────► consumer queue ──► session task ──► TCP
//! ```
//!
//! Pushing never blocks on the network: the sample is copied into one
//! bounded queue per connected inlet and the call returns.  An inlet that
//! falls behind loses its own oldest samples; the producer and the other
//! inlets are unaffected.
//!
//! A timestamp of `0.0` means "now" on the local clock.  Chunks pushed with
//! one timestamp treat it as the stamp of the last sample and back-date the
//! earlier ones by one sampling interval each.

use std::sync::Arc;
use std::time::Duration;

use labstream_core::protocol::messages::TransportMode;
use labstream_core::time::{Clock, LocalClock};
use labstream_core::{
    CancellationRegistry, Sample, SampleValue, SendBuffer, StreamInfo, ValueError, IRREGULAR_RATE,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::application::buffering::BufferSize;
use crate::error::{record, Result, StreamError};
use crate::infrastructure::config::ApiConfig;
use crate::infrastructure::network::data_server::{self, OutletContext};
use crate::infrastructure::network::sockets::{
    bind_multicast_responder, bind_service_socket, bind_tcp_listener, enabled_families, IpFamily,
};
use crate::infrastructure::network::udp_service::{self, ServiceContext};
use crate::infrastructure::runtime::IoRuntime;

/// How an outlet buffers and sends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutletOptions {
    /// Samples per batch in chunked mode; 0 batches by pushthrough and a
    /// short linger only.
    pub chunk_size: u32,
    /// Per-inlet buffer before the oldest samples are dropped.
    pub max_buffered: BufferSize,
    pub transport: TransportMode,
}

impl Default for OutletOptions {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_buffered: BufferSize::default(),
            transport: TransportMode::Chunked,
        }
    }
}

/// A published stream.
///
/// Dropping the outlet stops its servers, closes every data connection
/// (inlets then report the connection lost) and wakes any thread blocked in
/// [`wait_for_consumers`](Self::wait_for_consumers).
pub struct StreamOutlet {
    info: StreamInfo,
    config: Arc<ApiConfig>,
    send_buffer: Arc<SendBuffer>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Sender<bool>,
    sessions: CancellationRegistry,
    // Dropped last so the tasks above see the shutdown first.
    runtime: IoRuntime,
}

impl StreamOutlet {
    /// Publishes `info` with the process configuration.
    ///
    /// # Errors
    ///
    /// [`StreamError::Configuration`] for an unpublishable descriptor and
    /// [`StreamError::Io`] when no socket could be bound.  The message is
    /// also stored for [`last_error`](crate::last_error).
    pub fn new(info: StreamInfo, options: OutletOptions) -> Result<Self> {
        Self::with_config(info, options, ApiConfig::shared())
    }

    /// Publishes `info` with an explicit configuration.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_config(mut info: StreamInfo, options: OutletOptions, config: Arc<ApiConfig>) -> Result<Self> {
        info.validate_for_publishing().map_err(record)?;
        let runtime = IoRuntime::new("outlet").map_err(record)?;
        let clock: Arc<dyn Clock> = Arc::new(LocalClock);
        info.set_session_id(&config.lab.session_id);

        let mut bound = Vec::new();
        let mut last_error = None;
        for family in enabled_families(&config) {
            match bind_family(&config, family) {
                Ok(sockets) => {
                    let data_port = sockets.0.local_addr().map_or(0, |a| a.port());
                    let service_port = sockets.1.local_addr().map_or(0, |a| a.port());
                    match family {
                        IpFamily::V4 => info.set_v4ports(data_port, service_port),
                        IpFamily::V6 => info.set_v6ports(data_port, service_port),
                    }
                    bound.push((family, sockets));
                }
                Err(e) => {
                    warn!("outlet {} has no {family:?} endpoint: {e}", info.name());
                    last_error = Some(e);
                }
            }
        }
        if bound.is_empty() {
            let e = last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Unsupported, "no IP family is enabled")
            });
            return Err(record(e));
        }

        let tuning = &config.tuning;
        let capacity = options.max_buffered.to_samples(
            info.nominal_srate(),
            tuning.outlet_buffer_reserve_ms,
            tuning.outlet_buffer_reserve_samples,
        );
        let send_buffer = SendBuffer::new(capacity);
        let sessions = CancellationRegistry::new();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let service_context = Arc::new(ServiceContext {
            info: info.clone(),
            shortinfo: info.to_shortinfo_message().map_err(record)?,
            max_cached_queries: tuning.max_cached_queries,
            clock: Arc::clone(&clock),
        });
        let data_context = Arc::new(OutletContext {
            info: info.clone(),
            fullinfo: info.to_fullinfo_message().map_err(record)?,
            send_buffer: Arc::clone(&send_buffer),
            chunk_size: options.chunk_size,
            transport: options.transport,
            sessions: sessions.handle(),
            clock: Arc::clone(&clock),
        });

        {
            let _guard = runtime.handle().enter();
            for (family, (listener, service)) in bound {
                let listener = TcpListener::from_std(listener).map_err(record)?;
                let service = UdpSocket::from_std(service).map_err(record)?;
                runtime.spawn(data_server::serve(
                    listener,
                    Arc::clone(&data_context),
                    shutdown_rx.clone(),
                ));
                runtime.spawn(udp_service::serve(
                    service,
                    Arc::clone(&service_context),
                    shutdown_rx.clone(),
                ));

                match bind_multicast_responder(&config, family).and_then(UdpSocket::from_std) {
                    Ok(responder) => {
                        runtime.spawn(udp_service::serve(
                            responder,
                            Arc::clone(&service_context),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => warn!("outlet {} has no {family:?} multicast responder: {e}", info.name()),
                }
            }
        }

        info!(
            "outlet {} ({}) published: v4 {}/{}, v6 {}/{}",
            info.name(),
            info.uid(),
            info.v4data_port(),
            info.v4service_port(),
            info.v6data_port(),
            info.v6service_port()
        );
        Ok(Self {
            info,
            config,
            send_buffer,
            clock,
            shutdown,
            sessions,
            runtime,
        })
    }

    /// The published descriptor, ports included.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    // ── Pushing ───────────────────────────────────────────────────────────────

    /// Pushes one sample stamped now and sends it right away.
    ///
    /// # Errors
    ///
    /// [`StreamError::Value`] when `values` does not have one value per
    /// channel or does not convert to the stream's format.
    pub fn push_sample<T: SampleValue>(&self, values: &[T]) -> Result<()> {
        self.push_sample_at(values, 0.0, true)
    }

    /// Pushes one sample with an explicit timestamp (`0.0` for now).
    ///
    /// With `pushthrough = false` the sample may wait for more before it is
    /// sent.
    ///
    /// # Errors
    ///
    /// As [`push_sample`](Self::push_sample).
    pub fn push_sample_at<T: SampleValue>(&self, values: &[T], timestamp: f64, pushthrough: bool) -> Result<()> {
        let sample = self.make_sample(values, self.resolve_timestamp(timestamp), pushthrough)?;
        self.send_buffer.push_sample(sample);
        Ok(())
    }

    /// Pushes a chunk of samples, the last one stamped now.
    ///
    /// # Errors
    ///
    /// As [`push_sample`](Self::push_sample); nothing is pushed if any sample
    /// is malformed.
    pub fn push_chunk<T: SampleValue>(&self, samples: &[Vec<T>]) -> Result<()> {
        self.push_chunk_at(samples, 0.0, true)
    }

    /// Pushes a chunk whose last sample has `timestamp` (`0.0` for now).
    ///
    /// Earlier samples are back-dated by one sampling interval each; on
    /// irregular streams they all share the timestamp.
    ///
    /// # Errors
    ///
    /// As [`push_chunk`](Self::push_chunk).
    pub fn push_chunk_at<T: SampleValue>(&self, samples: &[Vec<T>], timestamp: f64, pushthrough: bool) -> Result<()> {
        let timestamps = self.backdated(samples.len(), timestamp);
        self.push_chunk_with_timestamps(samples, &timestamps, pushthrough)
    }

    /// Pushes a chunk with one timestamp per sample.
    ///
    /// # Errors
    ///
    /// [`ValueError::TimestampCountMismatch`] when the counts differ, else as
    /// [`push_chunk`](Self::push_chunk).
    pub fn push_chunk_with_timestamps<T: SampleValue>(
        &self,
        samples: &[Vec<T>],
        timestamps: &[f64],
        pushthrough: bool,
    ) -> Result<()> {
        if samples.len() != timestamps.len() {
            return Err(ValueError::TimestampCountMismatch {
                samples: samples.len(),
                timestamps: timestamps.len(),
            }
            .into());
        }
        let last = samples.len().saturating_sub(1);
        let chunk = samples
            .iter()
            .zip(timestamps)
            .enumerate()
            .map(|(i, (values, &ts))| {
                self.make_sample(values, self.resolve_timestamp(ts), pushthrough && i == last)
            })
            .collect::<Result<Vec<Sample>>>()?;
        self.send_buffer.push_chunk(chunk);
        Ok(())
    }

    /// Pushes a chunk given as one flat, channel-interleaved buffer.
    ///
    /// # Errors
    ///
    /// [`ValueError::RaggedChunk`] when the buffer length is not a multiple
    /// of the channel count, else as [`push_chunk_at`](Self::push_chunk_at).
    pub fn push_chunk_multiplexed<T: SampleValue>(&self, buffer: &[T], timestamp: f64, pushthrough: bool) -> Result<()> {
        let channels = self.info.channel_count();
        if channels == 0 || buffer.len() % channels != 0 {
            return Err(ValueError::RaggedChunk {
                len: buffer.len(),
                channels,
            }
            .into());
        }
        let samples: Vec<Vec<T>> = buffer.chunks(channels).map(<[T]>::to_vec).collect();
        self.push_chunk_at(&samples, timestamp, pushthrough)
    }

    // ── Consumers ─────────────────────────────────────────────────────────────

    /// Whether at least one inlet is connected.
    pub fn have_consumers(&self) -> bool {
        self.send_buffer.have_consumers()
    }

    /// Blocks until an inlet connects or `timeout` passes.  Returns whether
    /// one is connected.
    pub fn wait_for_consumers(&self, timeout: Duration) -> bool {
        self.send_buffer.wait_for_consumers(timeout)
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn resolve_timestamp(&self, timestamp: f64) -> f64 {
        if timestamp == 0.0 || self.config.tuning.force_default_timestamps {
            self.clock.now()
        } else {
            timestamp
        }
    }

    fn backdated(&self, count: usize, timestamp: f64) -> Vec<f64> {
        let last = self.resolve_timestamp(timestamp);
        let srate = self.info.nominal_srate();
        (0..count)
            .map(|i| {
                if srate == IRREGULAR_RATE {
                    last
                } else {
                    last - (count - 1 - i) as f64 / srate
                }
            })
            .collect()
    }

    fn make_sample<T: SampleValue>(&self, values: &[T], timestamp: f64, pushthrough: bool) -> Result<Sample> {
        let expected = self.info.channel_count();
        if values.len() != expected {
            return Err(StreamError::Value(ValueError::ChannelCountMismatch {
                expected,
                actual: values.len(),
            }));
        }
        let values = T::wrap(values.to_vec()).convert(self.info.channel_format())?;
        Ok(Sample::new(timestamp, values, pushthrough))
    }
}

impl Drop for StreamOutlet {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.sessions.cancel_all();
        self.send_buffer.interrupt();
        info!("outlet {} withdrawn", self.info.name());
    }
}

impl std::fmt::Debug for StreamOutlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOutlet")
            .field("name", &self.info.name())
            .field("uid", &self.info.uid())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

type FamilySockets = (std::net::TcpListener, std::net::UdpSocket);

fn bind_family(config: &ApiConfig, family: IpFamily) -> std::io::Result<FamilySockets> {
    let listener = bind_tcp_listener(config, family)?;
    let service = bind_service_socket(config, family)?;
    Ok((listener, service))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{clear_last_error, last_error};
    use crate::infrastructure::config::Ipv6Mode;
    use labstream_core::ChannelFormat;

    fn test_config() -> Arc<ApiConfig> {
        let mut config = ApiConfig::default();
        config.ports.ipv6 = Ipv6Mode::Disable;
        config.lab.session_id = "outlet-unit-tests".to_string();
        Arc::new(config)
    }

    fn make_outlet(srate: f64) -> StreamOutlet {
        let info = StreamInfo::new("Unit", "test", 2, srate, ChannelFormat::Int32, "unit").expect("info");
        StreamOutlet::with_config(info, OutletOptions::default(), test_config()).expect("outlet")
    }

    #[test]
    fn test_outlet_publishes_ports_and_session() {
        // Arrange / Act
        let outlet = make_outlet(10.0);

        // Assert
        let info = outlet.info();
        assert_ne!(info.v4data_port(), 0);
        assert_ne!(info.v4service_port(), 0);
        assert_eq!(info.v6data_port(), 0);
        assert_eq!(info.session_id(), "outlet-unit-tests");
        assert!(!outlet.have_consumers());
    }

    #[test]
    fn test_undefined_format_is_a_configuration_error_recorded_per_thread() {
        // Arrange
        clear_last_error();
        let info = StreamInfo::new("Bad", "test", 1, 1.0, ChannelFormat::Undefined, "").expect("info");

        // Act
        let result = StreamOutlet::with_config(info, OutletOptions::default(), test_config());

        // Assert
        assert!(matches!(result, Err(StreamError::Configuration(_))));
        assert!(last_error().is_some());
    }

    #[test]
    fn test_wrong_channel_count_is_rejected() {
        let outlet = make_outlet(10.0);

        let result = outlet.push_sample(&[1i32, 2, 3]);

        assert!(matches!(
            result,
            Err(StreamError::Value(ValueError::ChannelCountMismatch { expected: 2, actual: 3 }))
        ));
    }

    #[test]
    fn test_ragged_multiplexed_chunk_is_rejected() {
        let outlet = make_outlet(10.0);

        let result = outlet.push_chunk_multiplexed(&[1.0f32, 2.0, 3.0], 0.0, true);

        assert!(matches!(result, Err(StreamError::Value(ValueError::RaggedChunk { .. }))));
    }

    #[test]
    fn test_timestamp_count_must_match() {
        let outlet = make_outlet(10.0);

        let result = outlet.push_chunk_with_timestamps(&[vec![1i32, 2]], &[1.0, 2.0], true);

        assert!(matches!(
            result,
            Err(StreamError::Value(ValueError::TimestampCountMismatch { samples: 1, timestamps: 2 }))
        ));
    }

    #[test]
    fn test_chunk_is_backdated_from_last_timestamp() {
        // Arrange
        let outlet = make_outlet(10.0);

        // Act
        let stamps = outlet.backdated(3, 100.0);

        // Assert
        let expected = [99.8, 99.9, 100.0];
        for (got, want) in stamps.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
    }

    #[test]
    fn test_irregular_chunk_shares_one_timestamp() {
        let outlet = make_outlet(IRREGULAR_RATE);

        let stamps = outlet.backdated(3, 42.0);

        assert_eq!(stamps, vec![42.0; 3]);
    }

    #[test]
    fn test_wait_for_consumers_times_out_without_inlets() {
        let outlet = make_outlet(10.0);

        let connected = outlet.wait_for_consumers(Duration::from_millis(50));

        assert!(!connected);
    }

    #[test]
    fn test_values_convert_to_stream_format() {
        // Arrange – a float sample on an int32 stream
        let outlet = make_outlet(10.0);
        let consumer = outlet.send_buffer.new_consumer(0);

        // Act
        outlet.push_sample_at(&[1.0f64, -2.0], 5.0, true).expect("push");

        // Assert
        let sample = consumer.queue().try_pop().expect("sample");
        assert_eq!(sample.values, labstream_core::ChannelValues::Int32(vec![1, -2]));
        assert_eq!(sample.timestamp, 5.0);
    }
}
