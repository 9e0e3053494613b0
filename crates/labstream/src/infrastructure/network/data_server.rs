//! Outlet-side TCP server: full-info requests and sample feeds.
//!
//! Each accepted connection starts with one request frame:
//!
//! - `FullInfoRequest` is answered with the full descriptor (description
//!   tree included).  Further requests may follow on the same connection.
//! - `StreamFeedRequest` is checked (protocol version → 505, uid → 404,
//!   channel format → 400).  On success the outlet answers 200, sends a
//!   two-sample test-pattern batch the inlet validates, and from then on
//!   streams sample batches until either side goes away.
//!
//! # Feed sessions
//!
//! A session owns one [`Consumer`] of the outlet's send buffer, so it sees
//! every sample pushed after the handshake in push order, and drops only
//! its own oldest samples when the inlet falls behind.  The consumer queue
//! wakes the session through a `Notify`; the session then drains it and
//! writes batches:
//!
//! - in sync mode every wake-up is flushed immediately,
//! - in chunked mode samples are held until a pushthrough sample arrives,
//!   the outlet's chunk size is reached, or [`LINGER`] passes.
//!
//! Sessions register at the outlet's session registry; dropping the outlet
//! cancels them so inlets see the connection close promptly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use labstream_core::cancellation::{CancellableOperation, RegistryRef};
use labstream_core::protocol::messages::{
    ByteOrder, ErrorMessage, FeedStatus, SampleBatch, StreamFeedRequest, StreamFeedResponse,
    TransportMode,
};
use labstream_core::protocol::SequenceCounter;
use labstream_core::time::Clock;
use labstream_core::{
    ChannelValues, Consumer, Sample, SendBuffer, StreamInfo, WireMessage, STREAM_PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::infrastructure::network::framing::{read_frame, write_message};

/// Timestamp carried by both test-pattern samples.
pub const TEST_PATTERN_TIMESTAMP: f64 = 123_456.789;

/// Value offsets of the two test-pattern samples.
const TEST_PATTERN_OFFSETS: [i64; 2] = [4, 2];

/// How long chunked sessions hold back samples waiting for more.
const LINGER: Duration = Duration::from_millis(10);

/// Upper bound on samples per batch.
const MAX_BATCH_SAMPLES: usize = 1024;

/// How long a connection may sit idle before sending a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a connection needs from its outlet.
pub struct OutletContext {
    /// The published descriptor with ports filled in.
    pub info: StreamInfo,
    pub fullinfo: String,
    pub send_buffer: Arc<SendBuffer>,
    /// Samples per batch in chunked mode; 0 leaves batching to pushthrough
    /// and the linger timer.
    pub chunk_size: u32,
    pub transport: TransportMode,
    pub sessions: RegistryRef,
    pub clock: Arc<dyn Clock>,
}

/// The two samples sent after a successful feed handshake.
///
/// Returns an empty vector for formats without a pattern.
pub fn test_pattern_samples(info: &StreamInfo) -> Vec<Sample> {
    TEST_PATTERN_OFFSETS
        .iter()
        .filter_map(|&offset| {
            ChannelValues::test_pattern(info.channel_format(), info.channel_count(), offset)
        })
        .map(|values| Sample::new(TEST_PATTERN_TIMESTAMP, values, true))
        .collect()
}

/// Wraps samples of `info`'s stream into a batch message.
pub fn sample_batch(info: &StreamInfo, byte_order: ByteOrder, samples: Vec<Sample>) -> WireMessage {
    WireMessage::Samples(SampleBatch {
        channel_format: info.channel_format(),
        byte_order,
        channel_count: u32::try_from(info.channel_count()).unwrap_or(u32::MAX),
        nominal_srate: info.nominal_srate(),
        samples,
    })
}

/// Accepts connections until `shutdown` flips, serving each on its own task.
pub async fn serve(listener: TcpListener, context: Arc<OutletContext>, mut shutdown: watch::Receiver<bool>) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!("data server listening on {local}");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed on {local}: {e}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY for {peer}: {e}");
        }

        let context = Arc::clone(&context);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            debug!("connection from {peer}");
            match handle_connection(stream, context, shutdown).await {
                Ok(()) => debug!("connection from {peer} closed"),
                Err(e) => debug!("connection from {peer} ended: {e:#}"),
            }
        });
    }

    info!("data server on {local} stopped");
}

/// Serves one connection until the peer closes it, the request sequence
/// ends, or the outlet shuts down.
///
/// # Errors
///
/// Transport and protocol errors, with context.
pub async fn handle_connection<S>(
    stream: S,
    context: Arc<OutletContext>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let sequence = SequenceCounter::new();
    let clock = Arc::clone(&context.clock);

    loop {
        let request = tokio::time::timeout(REQUEST_TIMEOUT, read_frame(&mut reader))
            .await
            .context("no request received")?
            .context("reading request")?;
        let Some((_, request)) = request else {
            return Ok(());
        };

        match request {
            WireMessage::FullInfoRequest => {
                let reply = WireMessage::FullInfoReply(context.fullinfo.clone());
                write_message(&mut writer, &reply, sequence.next(), clock.as_ref())
                    .await
                    .context("sending full info")?;
            }
            WireMessage::StreamFeedRequest(request) => {
                let session = FeedSession {
                    context: Arc::clone(&context),
                    sequence,
                    shutdown,
                };
                return session.run(reader, writer, request).await;
            }
            other => {
                let reply = WireMessage::Error(ErrorMessage {
                    code: FeedStatus::BadRequest as u16,
                    description: format!("unexpected {:?} request", other.message_type()),
                });
                write_message(&mut writer, &reply, sequence.next(), clock.as_ref())
                    .await
                    .context("sending error reply")?;
                return Ok(());
            }
        }
    }
}

/// Checks a feed request against the served stream.
fn check_feed_request(request: &StreamFeedRequest, info: &StreamInfo) -> Result<(), (FeedStatus, String)> {
    if request.protocol_version != STREAM_PROTOCOL_VERSION {
        return Err((
            FeedStatus::VersionNotSupported,
            format!(
                "protocol version {} is not supported (this outlet speaks {STREAM_PROTOCOL_VERSION})",
                request.protocol_version
            ),
        ));
    }
    if request.uid != info.uid() {
        return Err((
            FeedStatus::NotFound,
            format!("stream {} is not served here", request.uid),
        ));
    }
    if request.channel_format != info.channel_format() {
        return Err((
            FeedStatus::BadRequest,
            format!(
                "requested format {} but the stream is {}",
                request.channel_format,
                info.channel_format()
            ),
        ));
    }
    Ok(())
}

struct FeedSession {
    context: Arc<OutletContext>,
    sequence: SequenceCounter,
    shutdown: watch::Receiver<bool>,
}

impl FeedSession {
    async fn run<R, W>(mut self, mut reader: R, mut writer: W, request: StreamFeedRequest) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let clock = Arc::clone(&self.context.clock);
        let info = &self.context.info;

        if let Err((status, message)) = check_feed_request(&request, info) {
            debug!("refusing feed request with {status:?}: {message}");
            let reply = WireMessage::StreamFeedResponse(StreamFeedResponse {
                status,
                protocol_version: STREAM_PROTOCOL_VERSION,
                byte_order: request.byte_order,
                transport: self.context.transport,
                message,
            });
            write_message(&mut writer, &reply, self.sequence.next(), clock.as_ref())
                .await
                .context("sending refusal")?;
            return Ok(());
        }

        let stop = Arc::new(Notify::new());
        let stopper = Arc::clone(&stop);
        let operation = CancellableOperation::from_fn(move || stopper.notify_one());
        if !operation.register_at_ref(&self.context.sessions) {
            return Ok(());
        }

        // Register before answering so no sample pushed after the inlet's
        // handshake completes is missed.
        let consumer = self
            .context
            .send_buffer
            .new_consumer(request.max_buflen as usize);
        let transport = self.context.transport.negotiate(request.transport);
        let byte_order = request.byte_order;

        let reply = WireMessage::StreamFeedResponse(StreamFeedResponse {
            status: FeedStatus::Ok,
            protocol_version: STREAM_PROTOCOL_VERSION,
            byte_order,
            transport,
            message: String::new(),
        });
        write_message(&mut writer, &reply, self.sequence.next(), clock.as_ref())
            .await
            .context("sending feed response")?;
        let pattern = sample_batch(info, byte_order, test_pattern_samples(info));
        write_message(&mut writer, &pattern, 0, clock.as_ref())
            .await
            .context("sending test pattern")?;
        info!("feed session {} started ({transport:?})", consumer.id());

        let max_batch = match request.max_chunklen {
            0 => MAX_BATCH_SAMPLES,
            n => (n as usize).min(MAX_BATCH_SAMPLES),
        };
        let result = self
            .transfer(&mut reader, &mut writer, &consumer, &stop, transport, byte_order, max_batch)
            .await;
        consumer.queue().clear_listener();
        info!("feed session {} ended", consumer.id());
        drop(operation);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        consumer: &Consumer,
        stop: &Notify,
        transport: TransportMode,
        byte_order: ByteOrder,
        max_batch: usize,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let wake = Arc::new(Notify::new());
        let waker = Arc::clone(&wake);
        consumer.queue().set_listener(move || waker.notify_one());

        let chunk_size = match transport {
            TransportMode::Sync => 1,
            TransportMode::Chunked => self.context.chunk_size as usize,
        };
        let mut pending: Vec<Sample> = Vec::new();
        let mut linger_until: Option<Instant> = None;
        let mut scratch = [0u8; 64];

        loop {
            let room = max_batch.saturating_sub(pending.len()).max(1);
            let queued = consumer.queue().drain_up_to(room);
            // A batch carries only its first sequence number, so samples after
            // an overflow gap must start a new batch.
            let gap = match (pending.last(), queued.first()) {
                (Some(last), Some(next)) => next.sequence != last.sequence.wrapping_add(1),
                _ => false,
            };
            if gap {
                linger_until = None;
                self.send_pending(writer, &mut pending, byte_order).await?;
            }
            let flush_now = queued.iter().any(|s| s.pushthrough)
                || (chunk_size > 0 && pending.len() + queued.len() >= chunk_size);
            pending.extend(queued);

            if !pending.is_empty() && (flush_now || pending.len() >= max_batch) {
                linger_until = None;
                self.send_pending(writer, &mut pending, byte_order).await?;
                continue;
            }
            // The linger clock starts with the oldest held sample.
            if pending.is_empty() {
                linger_until = None;
            } else if linger_until.is_none() {
                linger_until = Some(Instant::now() + LINGER);
            }

            tokio::select! {
                biased;
                _ = stop.notified() => return Ok(()),
                _ = self.shutdown.changed() => return Ok(()),
                read = reader.read(&mut scratch) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e).context("watching for peer close"),
                },
                _ = wake.notified() => {}
                _ = sleep_until(linger_until) => {
                    linger_until = None;
                    self.send_pending(writer, &mut pending, byte_order).await?;
                }
            }
        }
    }

    async fn send_pending<W>(
        &self,
        writer: &mut W,
        pending: &mut Vec<Sample>,
        byte_order: ByteOrder,
    ) -> Result<(), StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let samples = std::mem::take(pending);
        let Some(first) = samples.first().map(|s| s.sequence) else {
            return Ok(());
        };
        let batch = sample_batch(&self.context.info, byte_order, samples);
        write_message(writer, &batch, first, self.context.clock.as_ref()).await
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use labstream_core::protocol::codec::encode_message;
    use labstream_core::{CancellationRegistry, ChannelFormat};
    use tokio_test::io::Builder;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> f64 {
            100.0
        }
    }

    const FIXED_TS_US: u64 = 100_000_000;

    fn make_context(registry: &CancellationRegistry) -> (Arc<OutletContext>, Arc<SendBuffer>) {
        let info = StreamInfo::new("fullinfo", "unittest", 1, 1.0, ChannelFormat::Int8, "fullinfo1234")
            .expect("info");
        let fullinfo = info.to_fullinfo_message().expect("serialize");
        let send_buffer = SendBuffer::new(16);
        let context = Arc::new(OutletContext {
            info,
            fullinfo,
            send_buffer: Arc::clone(&send_buffer),
            chunk_size: 0,
            transport: TransportMode::Chunked,
            sessions: registry.handle(),
            clock: Arc::new(FixedClock),
        });
        (context, send_buffer)
    }

    fn feed_request(context: &OutletContext) -> StreamFeedRequest {
        StreamFeedRequest {
            protocol_version: STREAM_PROTOCOL_VERSION,
            uid: context.info.uid().to_string(),
            channel_format: ChannelFormat::Int8,
            byte_order: ByteOrder::Big,
            transport: TransportMode::Chunked,
            max_buflen: 8,
            max_chunklen: 0,
        }
    }

    fn frame(msg: &WireMessage, seq: u64) -> Vec<u8> {
        encode_message(msg, seq, FIXED_TS_US).expect("encode")
    }

    fn refusal(status: FeedStatus, message: String) -> WireMessage {
        WireMessage::StreamFeedResponse(StreamFeedResponse {
            status,
            protocol_version: STREAM_PROTOCOL_VERSION,
            byte_order: ByteOrder::Big,
            transport: TransportMode::Chunked,
            message,
        })
    }

    #[tokio::test]
    async fn test_full_info_request_is_answered_with_description() {
        // Arrange
        let registry = CancellationRegistry::new();
        let (context, _buffer) = make_context(&registry);
        let mock = Builder::new()
            .read(&frame(&WireMessage::FullInfoRequest, 0))
            .write(&frame(&WireMessage::FullInfoReply(context.fullinfo.clone()), 0))
            .build();
        let (_stop_tx, stop_rx) = watch::channel(false);

        // Act
        let result = handle_connection(mock, context, stop_rx).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_uid_is_refused_with_404() {
        // Arrange
        let registry = CancellationRegistry::new();
        let (context, buffer) = make_context(&registry);
        let mut request = feed_request(&context);
        request.uid = "not-this-one".to_string();
        let expected = refusal(
            FeedStatus::NotFound,
            "stream not-this-one is not served here".to_string(),
        );
        let mock = Builder::new()
            .read(&frame(&WireMessage::StreamFeedRequest(request), 0))
            .write(&frame(&expected, 0))
            .build();
        let (_stop_tx, stop_rx) = watch::channel(false);

        // Act
        let result = handle_connection(mock, context, stop_rx).await;

        // Assert
        assert!(result.is_ok());
        assert_eq!(buffer.consumer_count(), 0);
    }

    #[test]
    fn test_feed_request_checks_version_then_uid_then_format() {
        let registry = CancellationRegistry::new();
        let (context, _buffer) = make_context(&registry);

        let mut wrong_version = feed_request(&context);
        wrong_version.protocol_version = 100;
        wrong_version.uid = "x".to_string();
        let mut wrong_format = feed_request(&context);
        wrong_format.channel_format = ChannelFormat::Float32;

        assert_eq!(
            check_feed_request(&wrong_version, &context.info).map_err(|(s, _)| s),
            Err(FeedStatus::VersionNotSupported)
        );
        assert_eq!(
            check_feed_request(&wrong_format, &context.info).map_err(|(s, _)| s),
            Err(FeedStatus::BadRequest)
        );
        assert_eq!(check_feed_request(&feed_request(&context), &context.info), Ok(()));
    }

    #[tokio::test]
    async fn test_accepted_feed_sends_response_then_test_pattern() {
        // Arrange – the mock closes right after the handshake
        let registry = CancellationRegistry::new();
        let (context, buffer) = make_context(&registry);
        let request = feed_request(&context);
        let accepted = WireMessage::StreamFeedResponse(StreamFeedResponse {
            status: FeedStatus::Ok,
            protocol_version: STREAM_PROTOCOL_VERSION,
            byte_order: ByteOrder::Big,
            transport: TransportMode::Chunked,
            message: String::new(),
        });
        let pattern = sample_batch(
            &context.info,
            ByteOrder::Big,
            test_pattern_samples(&context.info),
        );
        let mock = Builder::new()
            .read(&frame(&WireMessage::StreamFeedRequest(request), 0))
            .write(&frame(&accepted, 0))
            .write(&frame(&pattern, 0))
            .build();
        let (_stop_tx, stop_rx) = watch::channel(false);

        // Act
        let result = handle_connection(mock, context, stop_rx).await;

        // Assert – the session ended on EOF and released its consumer
        assert!(result.is_ok());
        assert_eq!(buffer.consumer_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pattern_has_two_samples_with_fixed_timestamp() {
        let registry = CancellationRegistry::new();
        let (context, _buffer) = make_context(&registry);

        let samples = test_pattern_samples(&context.info);

        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.timestamp == TEST_PATTERN_TIMESTAMP));
        assert_ne!(samples[0].values, samples[1].values);
    }

    #[tokio::test]
    async fn test_feed_over_tcp_delivers_pushed_samples_in_order() {
        // Arrange
        let registry = CancellationRegistry::new();
        let (context, buffer) = make_context(&registry);
        let request = feed_request(&context);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&context), stop_rx));
        let mut client = tokio::net::TcpStream::connect(addr).await.expect("connect");

        // Act
        write_message(&mut client, &WireMessage::StreamFeedRequest(request), 0, &FixedClock)
            .await
            .expect("send request");
        let response = read_frame(&mut client).await.expect("read").expect("frame");
        let pattern = read_frame(&mut client).await.expect("read").expect("frame");
        for i in 0..3 {
            buffer.push_sample(Sample::new(f64::from(i), ChannelValues::Int8(vec![i as i8]), true));
        }
        let mut received = Vec::new();
        while received.len() < 3 {
            let (_, msg) = read_frame(&mut client).await.expect("read").expect("frame");
            if let WireMessage::Samples(batch) = msg {
                received.extend(batch.samples);
            }
        }
        stop_tx.send(true).expect("stop");
        server.await.expect("server task");

        // Assert
        assert!(matches!(
            response.1,
            WireMessage::StreamFeedResponse(StreamFeedResponse { status: FeedStatus::Ok, .. })
        ));
        assert!(matches!(pattern.1, WireMessage::Samples(_)));
        let stamps: Vec<f64> = received.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![0.0, 1.0, 2.0]);
        let sequences: Vec<u64> = received.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_overflow_gap_starts_a_new_batch() {
        // Arrange – timestamps equal the sequence numbers they were given
        let registry = CancellationRegistry::new();
        let (context, buffer) = make_context(&registry);
        let request = feed_request(&context);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&context), stop_rx));
        let mut client = tokio::net::TcpStream::connect(addr).await.expect("connect");
        write_message(&mut client, &WireMessage::StreamFeedRequest(request), 0, &FixedClock)
            .await
            .expect("send request");
        read_frame(&mut client).await.expect("read").expect("response");
        read_frame(&mut client).await.expect("read").expect("pattern");

        // Act – a held sample, then a chunk larger than the 8-sample queue
        buffer.push_sample(Sample::new(0.0, ChannelValues::Int8(vec![0]), false));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let chunk = (1..=20)
            .map(|i| Sample::new(f64::from(i), ChannelValues::Int8(vec![i as i8]), i == 20))
            .collect();
        buffer.push_chunk(chunk);
        let mut received = Vec::new();
        while received.last().map(|s: &Sample| s.timestamp) != Some(20.0) {
            let (_, msg) = read_frame(&mut client).await.expect("read").expect("frame");
            if let WireMessage::Samples(batch) = msg {
                received.extend(batch.samples);
            }
        }
        stop_tx.send(true).expect("stop");
        server.await.expect("server task");

        // Assert
        for sample in &received {
            assert_eq!(sample.sequence as f64, sample.timestamp, "{received:?}");
        }
        let tail: Vec<u64> = received.iter().rev().take(8).rev().map(|s| s.sequence).collect();
        assert_eq!(tail, (13..=20).collect::<Vec<u64>>());
    }
}
