//! Inlet-side data feed: connects to the outlet's data server, negotiates
//! the feed, and fills the inlet's sample queue in the background.
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──open──► Connecting ──200 + test pattern──► Connected
//!                      │                                  │
//!                      └──refused──► Failed       peer gone ──► (connection lost)
//! ```
//!
//! A refusal (400 / 505, or a test pattern that does not match) leaves the
//! connection usable for `info` and time sync and is reported as a
//! configuration problem.  A refused connect, a 404, or the socket closing
//! mid-stream means the outlet is gone and marks the whole
//! [`InletConnection`] lost.

use std::sync::Arc;

use labstream_core::cancellation::WaitSlot;
use labstream_core::protocol::messages::{
    ByteOrder, FeedStatus, StreamFeedRequest, StreamFeedResponse, TransportMode,
};
use labstream_core::time::Clock;
use labstream_core::{ConsumerQueue, Sample, StreamInfo, WireMessage, STREAM_PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::error::{Result, StreamError};
use crate::infrastructure::network::data_server::test_pattern_samples;
use crate::infrastructure::network::framing::{read_frame, write_message};
use crate::infrastructure::network::inlet_connection::InletConnection;

/// What the inlet asks the outlet for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedParams {
    /// Samples the outlet may hold for this inlet before dropping the oldest.
    pub max_buflen: u32,
    /// Largest batch the outlet may send; 0 leaves it to the outlet.
    pub max_chunklen: u32,
    pub transport: TransportMode,
}

/// Where the data feed stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedState {
    #[default]
    Closed,
    Connecting,
    Connected,
    /// The outlet refused the feed; the message says why.
    Failed(String),
}

impl FeedState {
    /// Whether a caller waiting for the feed can stop waiting.
    pub fn is_settled(&self) -> bool {
        matches!(self, FeedState::Connected | FeedState::Failed(_))
    }
}

/// Runs the feed handshake on an open stream and validates the test
/// pattern.  Returns the negotiated transport mode.
///
/// # Errors
///
/// - [`StreamError::ConnectionLost`] for a 404 or a stream that closes,
/// - [`StreamError::Configuration`] for other refusals and a bad pattern,
/// - [`StreamError::Io`] / [`StreamError::Protocol`] for transport faults.
pub async fn negotiate<S>(
    stream: &mut S,
    info: &StreamInfo,
    params: FeedParams,
    clock: &dyn Clock,
) -> Result<TransportMode>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = WireMessage::StreamFeedRequest(StreamFeedRequest {
        protocol_version: STREAM_PROTOCOL_VERSION,
        uid: info.uid().to_string(),
        channel_format: info.channel_format(),
        byte_order: ByteOrder::native(),
        transport: params.transport,
        max_buflen: params.max_buflen,
        max_chunklen: params.max_chunklen,
    });
    write_message(stream, &request, 0, clock).await?;

    let response = match read_frame(stream).await? {
        Some((_, WireMessage::StreamFeedResponse(response))) => response,
        Some((_, other)) => {
            return Err(StreamError::Configuration(format!(
                "outlet answered the feed request with {:?}",
                other.message_type()
            )))
        }
        None => {
            return Err(StreamError::ConnectionLost(
                "outlet closed the connection during the handshake".to_string(),
            ))
        }
    };
    let transport = check_response(response)?;

    match read_frame(stream).await? {
        Some((_, WireMessage::Samples(batch))) if pattern_matches(info, &batch.samples) => Ok(transport),
        Some(_) => Err(StreamError::Configuration(
            "the outlet's test pattern does not match; the stream is incompatible".to_string(),
        )),
        None => Err(StreamError::ConnectionLost(
            "outlet closed the connection before the test pattern".to_string(),
        )),
    }
}

fn check_response(response: StreamFeedResponse) -> Result<TransportMode> {
    match response.status {
        FeedStatus::Ok => Ok(response.transport),
        FeedStatus::NotFound => Err(StreamError::ConnectionLost(format!(
            "the outlet no longer serves this stream: {}",
            response.message
        ))),
        status => Err(StreamError::Configuration(format!(
            "outlet refused the feed ({}): {}",
            status as u16, response.message
        ))),
    }
}

fn pattern_matches(info: &StreamInfo, received: &[Sample]) -> bool {
    let expected = test_pattern_samples(info);
    expected.len() == received.len()
        && expected
            .iter()
            .zip(received)
            .all(|(e, r)| e.timestamp == r.timestamp && e.values == r.values)
}

/// Connects, negotiates and then moves every received sample into `queue`
/// until `stop` flips or the outlet goes away.
///
/// Progress is published through `state`.  Transport failures mark `conn`
/// lost, which wakes every wait tied to it.
pub async fn run(
    conn: Arc<InletConnection>,
    params: FeedParams,
    queue: Arc<ConsumerQueue>,
    state: Arc<WaitSlot<FeedState>>,
    clock: Arc<dyn Clock>,
    mut stop: watch::Receiver<bool>,
) {
    state.update(|s| *s = FeedState::Connecting);
    let addr = conn.data_addr();

    let opened = tokio::select! {
        _ = stop.changed() => {
            state.update(|s| *s = FeedState::Closed);
            return;
        }
        opened = open(&conn, params, clock.as_ref()) => opened,
    };
    let mut stream = match opened {
        Ok((stream, transport)) => {
            info!("data feed from {addr} connected ({transport:?})");
            state.update(|s| *s = FeedState::Connected);
            stream
        }
        Err(StreamError::ConnectionLost(reason)) => {
            conn.mark_lost(reason.clone());
            state.update(|s| *s = FeedState::Failed(reason));
            return;
        }
        Err(e) => {
            debug!("data feed from {addr} refused: {e}");
            state.update(|s| *s = FeedState::Failed(e.to_string()));
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some((_, WireMessage::Samples(batch)))) => {
                    let dropped = queue.push_many(batch.samples);
                    if dropped > 0 {
                        trace!("inlet queue overflowed; dropped {dropped} oldest samples");
                    }
                }
                Ok(Some((_, other))) => {
                    debug!("ignoring {:?} on data feed from {addr}", other.message_type());
                }
                Ok(None) => {
                    conn.mark_lost("the outlet closed the data connection");
                    break;
                }
                Err(e) => {
                    conn.mark_lost(format!("data connection failed: {e}"));
                    break;
                }
            },
        }
    }
    state.update(|s| {
        if *s == FeedState::Connected {
            *s = FeedState::Closed;
        }
    });
    debug!("data feed from {addr} stopped");
}

async fn open(
    conn: &InletConnection,
    params: FeedParams,
    clock: &dyn Clock,
) -> Result<(TcpStream, TransportMode)> {
    let addr = conn.data_addr();
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| StreamError::ConnectionLost(format!("cannot reach the outlet at {addr}: {e}")))?;
    stream.set_nodelay(true)?;
    let transport = negotiate(&mut stream, conn.info(), params, clock).await?;
    Ok((stream, transport))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
