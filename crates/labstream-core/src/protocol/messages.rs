//! Message types carried by the discovery and session protocols.
//!
//! One message enum covers both transports:
//!
//! | Message              | Transport | Direction        |
//! |----------------------|-----------|------------------|
//! | `ShortInfoQuery`     | UDP       | resolver → outlet |
//! | `ShortInfoReply`     | UDP       | outlet → resolver |
//! | `TimeProbe`          | UDP       | inlet → outlet   |
//! | `TimeReply`          | UDP       | outlet → inlet   |
//! | `FullInfoRequest`    | TCP       | inlet → outlet   |
//! | `FullInfoReply`      | TCP       | outlet → inlet   |
//! | `StreamFeedRequest`  | TCP       | inlet → outlet   |
//! | `StreamFeedResponse` | TCP       | outlet → inlet   |
//! | `Samples`            | TCP       | outlet → inlet   |
//! | `Error`              | both      | either           |
//!
//! Every message travels behind the same 24-byte header (see
//! [`codec`](crate::protocol::codec)).

use crate::domain::channel_format::ChannelFormat;
use crate::domain::sample::Sample;

/// Version byte of the message framing.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload a stream reader accepts before treating the peer as
/// broken.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Message type discriminant, the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ShortInfoQuery = 0x01,
    ShortInfoReply = 0x02,
    FullInfoRequest = 0x03,
    FullInfoReply = 0x04,
    StreamFeedRequest = 0x05,
    StreamFeedResponse = 0x06,
    TimeProbe = 0x07,
    TimeReply = 0x08,
    Samples = 0x10,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(MessageType::ShortInfoQuery),
            0x02 => Ok(MessageType::ShortInfoReply),
            0x03 => Ok(MessageType::FullInfoRequest),
            0x04 => Ok(MessageType::FullInfoReply),
            0x05 => Ok(MessageType::StreamFeedRequest),
            0x06 => Ok(MessageType::StreamFeedResponse),
            0x07 => Ok(MessageType::TimeProbe),
            0x08 => Ok(MessageType::TimeReply),
            0x10 => Ok(MessageType::Samples),
            0xFF => Ok(MessageType::Error),
            other => Err(other),
        }
    }
}

/// Byte order of numbers inside a sample batch.
///
/// Headers and control messages are always big-endian; sample values use
/// whatever order the inlet asked for so a little-endian consumer never
/// swaps bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ByteOrder {
    Little = 0,
    Big = 1,
}

impl ByteOrder {
    /// The byte order of the running machine.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

impl TryFrom<u8> for ByteOrder {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(ByteOrder::Little),
            1 => Ok(ByteOrder::Big),
            other => Err(other),
        }
    }
}

/// How an outlet session paces writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TransportMode {
    /// Coalesce samples until a pushthrough sample or a full chunk.
    #[default]
    Chunked = 0,
    /// Write every sample as soon as it is pushed.
    Sync = 1,
}

impl TransportMode {
    /// Sync wins if either side asks for it.
    pub fn negotiate(self, other: TransportMode) -> TransportMode {
        if self == TransportMode::Sync || other == TransportMode::Sync {
            TransportMode::Sync
        } else {
            TransportMode::Chunked
        }
    }
}

impl TryFrom<u8> for TransportMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(TransportMode::Chunked),
            1 => Ok(TransportMode::Sync),
            other => Err(other),
        }
    }
}

/// Outcome of a stream feed request, modelled on HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FeedStatus {
    Ok = 200,
    /// Malformed request or incompatible channel format.
    BadRequest = 400,
    /// The outlet does not serve the requested uid (anymore).
    NotFound = 404,
    /// The requested protocol version is not supported.
    VersionNotSupported = 505,
}

impl TryFrom<u16> for FeedStatus {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            200 => Ok(FeedStatus::Ok),
            400 => Ok(FeedStatus::BadRequest),
            404 => Ok(FeedStatus::NotFound),
            505 => Ok(FeedStatus::VersionNotSupported),
            other => Err(other),
        }
    }
}

// ── Message payloads ──────────────────────────────────────────────────────────

/// Discovery query sent to outlets.
#[derive(Debug, Clone, PartialEq)]
pub struct ShortInfoQuery {
    /// UDP port on the querying host that replies go to.
    pub return_port: u16,
    /// Hash of `query`, echoed in replies.
    pub query_id: u64,
    /// Canonical predicate text.
    pub query: String,
}

/// An outlet's answer to a matching query.
#[derive(Debug, Clone, PartialEq)]
pub struct ShortInfoReply {
    pub query_id: u64,
    /// Short-info serialization of the outlet's descriptor.
    pub info: String,
}

/// Request to open a sample feed on a data connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFeedRequest {
    pub protocol_version: u32,
    /// Uid the inlet expects the outlet to serve.
    pub uid: String,
    pub channel_format: ChannelFormat,
    pub byte_order: ByteOrder,
    pub transport: TransportMode,
    /// Samples the outlet may buffer for this consumer (0 = outlet default).
    pub max_buflen: u32,
    /// Largest batch the inlet wants (0 = outlet default).
    pub max_chunklen: u32,
}

/// The outlet's verdict on a [`StreamFeedRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFeedResponse {
    pub status: FeedStatus,
    pub protocol_version: u32,
    pub byte_order: ByteOrder,
    pub transport: TransportMode,
    /// Human-readable reason, empty on success.
    pub message: String,
}

/// Clock probe: `t0` is the inlet's local send time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeProbe {
    pub wave_id: u32,
    pub t0: f64,
}

/// Clock probe echo: `t1` is the outlet's receipt time and `t2` its reply
/// time, both on the outlet's clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeReply {
    pub wave_id: u32,
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
}

/// A run of consecutive samples of one stream.
///
/// The header sequence number of the carrying message is the sequence of
/// the first sample; the rest follow without gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub channel_format: ChannelFormat,
    pub byte_order: ByteOrder,
    pub channel_count: u32,
    pub nominal_srate: f64,
    pub samples: Vec<Sample>,
}

/// Protocol-level error report.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub code: u16,
    pub description: String,
}

/// Every message of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    ShortInfoQuery(ShortInfoQuery),
    ShortInfoReply(ShortInfoReply),
    FullInfoRequest,
    /// Full-info serialization of the outlet's descriptor.
    FullInfoReply(String),
    StreamFeedRequest(StreamFeedRequest),
    StreamFeedResponse(StreamFeedResponse),
    TimeProbe(TimeProbe),
    TimeReply(TimeReply),
    Samples(SampleBatch),
    Error(ErrorMessage),
}

impl WireMessage {
    /// The header discriminant for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::ShortInfoQuery(_) => MessageType::ShortInfoQuery,
            WireMessage::ShortInfoReply(_) => MessageType::ShortInfoReply,
            WireMessage::FullInfoRequest => MessageType::FullInfoRequest,
            WireMessage::FullInfoReply(_) => MessageType::FullInfoReply,
            WireMessage::StreamFeedRequest(_) => MessageType::StreamFeedRequest,
            WireMessage::StreamFeedResponse(_) => MessageType::StreamFeedResponse,
            WireMessage::TimeProbe(_) => MessageType::TimeProbe,
            WireMessage::TimeReply(_) => MessageType::TimeReply,
            WireMessage::Samples(_) => MessageType::Samples,
            WireMessage::Error(_) => MessageType::Error,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
