//! Binary codec for labstream protocol messages.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][seq:8][timestamp_us:8][payload:N]
//! ```
//! Total header size: 24 bytes.  All header fields and control payloads are
//! big-endian; sample values follow the byte order named inside the batch.
//!
//! The same framing is used for UDP datagrams (one message per datagram)
//! and for TCP streams (messages back to back; read the header, then
//! `payload_len` bytes).

use crate::protocol::messages::{
    ByteOrder, ErrorMessage, FeedStatus, MessageType, ShortInfoQuery, ShortInfoReply,
    StreamFeedRequest, StreamFeedResponse, TimeProbe, TimeReply, TransportMode, WireMessage,
    HEADER_SIZE, PROTOCOL_VERSION,
};
use crate::protocol::sample_codec::{decode_batch, encode_batch};
use crate::domain::channel_format::ChannelFormat;
use thiserror::Error;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encoded payload length field does not match the actual data available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// A stream peer announced a payload larger than readers accept.
    #[error("payload of {declared} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { declared: usize, max: usize },
}

/// The decoded fixed header of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub payload_len: usize,
    /// Sender-assigned sequence number; for sample batches the sequence of
    /// the first sample.
    pub sequence: u64,
    /// Sender's local clock at encode time, in microseconds.
    pub timestamp_us: u64,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`WireMessage`] into a byte vector including the 24-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError`] if a field does not fit its wire width.
///
/// # Examples
///
/// ```rust
/// use labstream_core::protocol::{decode_message, encode_message};
/// use labstream_core::protocol::messages::{TimeProbe, WireMessage};
///
/// let msg = WireMessage::TimeProbe(TimeProbe { wave_id: 7, t0: 1.25 });
/// let bytes = encode_message(&msg, 0, 0).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    msg: &WireMessage,
    sequence_number: u64,
    timestamp_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 64);

    // Header: version (1) + msg_type (1) + reserved (2) + payload_len (4) +
    //         seq (8) + timestamp_us (8) = 24 bytes
    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.push(0x00);
    buf.push(0x00);
    buf.extend_from_slice(&[0u8; 4]); // payload_len, patched below
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());

    encode_payload(&mut buf, msg)?;

    let payload_len = u32::try_from(buf.len() - HEADER_SIZE).map_err(|_| {
        ProtocolError::MalformedPayload(format!("payload of {} bytes", buf.len() - HEADER_SIZE))
    })?;
    buf[4..8].copy_from_slice(&payload_len.to_be_bytes());
    Ok(buf)
}

/// Decodes the 24-byte header at the beginning of `bytes`.
///
/// Stream readers call this first, then read `payload_len` more bytes.
///
/// # Errors
///
/// Returns [`ProtocolError`] for short input, unknown versions or types.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let msg_type_byte = bytes[1];
    let message_type = MessageType::try_from(msg_type_byte)
        .map_err(|_| ProtocolError::UnknownMessageType(msg_type_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    Ok(MessageHeader {
        message_type,
        payload_len: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize,
        sequence: read_u64(bytes, 8)?,
        timestamp_us: read_u64(bytes, 16)?,
    })
}

/// Decodes one [`WireMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (header + payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_message(bytes: &[u8]) -> Result<(WireMessage, usize), ProtocolError> {
    let (_, msg, consumed) = decode_frame(bytes)?;
    Ok((msg, consumed))
}

/// Like [`decode_message`] but also returns the header.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(MessageHeader, WireMessage, usize), ProtocolError> {
    let header = decode_header(bytes)?;

    let total_needed = HEADER_SIZE + header.payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: header.payload_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let payload = &bytes[HEADER_SIZE..total_needed];
    let msg = decode_payload(&header, payload)?;
    Ok((header, msg, total_needed))
}

/// Decodes a payload whose header was already read.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the payload is malformed.
pub fn decode_payload(header: &MessageHeader, payload: &[u8]) -> Result<WireMessage, ProtocolError> {
    match header.message_type {
        MessageType::ShortInfoQuery => decode_short_info_query(payload).map(WireMessage::ShortInfoQuery),
        MessageType::ShortInfoReply => decode_short_info_reply(payload).map(WireMessage::ShortInfoReply),
        MessageType::FullInfoRequest => Ok(WireMessage::FullInfoRequest),
        MessageType::FullInfoReply => {
            let (info, _) = read_long_string(payload, 0)?;
            Ok(WireMessage::FullInfoReply(info))
        }
        MessageType::StreamFeedRequest => {
            decode_feed_request(payload).map(WireMessage::StreamFeedRequest)
        }
        MessageType::StreamFeedResponse => {
            decode_feed_response(payload).map(WireMessage::StreamFeedResponse)
        }
        MessageType::TimeProbe => {
            require_len(payload, 12, "TimeProbe")?;
            Ok(WireMessage::TimeProbe(TimeProbe {
                wave_id: read_u32(payload, 0)?,
                t0: read_f64(payload, 4)?,
            }))
        }
        MessageType::TimeReply => {
            require_len(payload, 28, "TimeReply")?;
            Ok(WireMessage::TimeReply(TimeReply {
                wave_id: read_u32(payload, 0)?,
                t0: read_f64(payload, 4)?,
                t1: read_f64(payload, 12)?,
                t2: read_f64(payload, 20)?,
            }))
        }
        MessageType::Samples => decode_batch(payload, header.sequence).map(WireMessage::Samples),
        MessageType::Error => decode_error(payload).map(WireMessage::Error),
    }
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(buf: &mut Vec<u8>, msg: &WireMessage) -> Result<(), ProtocolError> {
    match msg {
        WireMessage::ShortInfoQuery(m) => {
            buf.extend_from_slice(&m.return_port.to_be_bytes());
            buf.extend_from_slice(&m.query_id.to_be_bytes());
            write_length_prefixed_string(buf, &m.query)?;
        }
        WireMessage::ShortInfoReply(m) => {
            buf.extend_from_slice(&m.query_id.to_be_bytes());
            write_long_string(buf, &m.info)?;
        }
        WireMessage::FullInfoRequest => {} // empty payload
        WireMessage::FullInfoReply(info) => write_long_string(buf, info)?,
        WireMessage::StreamFeedRequest(m) => encode_feed_request(buf, m)?,
        WireMessage::StreamFeedResponse(m) => {
            buf.extend_from_slice(&(m.status as u16).to_be_bytes());
            buf.extend_from_slice(&m.protocol_version.to_be_bytes());
            buf.push(m.byte_order as u8);
            buf.push(m.transport as u8);
            write_length_prefixed_string(buf, &m.message)?;
        }
        WireMessage::TimeProbe(m) => {
            buf.extend_from_slice(&m.wave_id.to_be_bytes());
            buf.extend_from_slice(&m.t0.to_be_bytes());
        }
        WireMessage::TimeReply(m) => {
            buf.extend_from_slice(&m.wave_id.to_be_bytes());
            buf.extend_from_slice(&m.t0.to_be_bytes());
            buf.extend_from_slice(&m.t1.to_be_bytes());
            buf.extend_from_slice(&m.t2.to_be_bytes());
        }
        WireMessage::Samples(batch) => encode_batch(buf, batch)?,
        WireMessage::Error(m) => {
            buf.extend_from_slice(&m.code.to_be_bytes());
            write_length_prefixed_string(buf, &m.description)?;
        }
    }
    Ok(())
}

fn encode_feed_request(buf: &mut Vec<u8>, m: &StreamFeedRequest) -> Result<(), ProtocolError> {
    buf.extend_from_slice(&m.protocol_version.to_be_bytes());
    buf.push(m.channel_format as u8);
    buf.push(m.byte_order as u8);
    buf.push(m.transport as u8);
    buf.extend_from_slice(&m.max_buflen.to_be_bytes());
    buf.extend_from_slice(&m.max_chunklen.to_be_bytes());
    write_length_prefixed_string(buf, &m.uid)
}

// ── Per-message decode helpers ────────────────────────────────────────────────

fn decode_short_info_query(p: &[u8]) -> Result<ShortInfoQuery, ProtocolError> {
    require_len(p, 10, "ShortInfoQuery")?;
    let return_port = u16::from_be_bytes([p[0], p[1]]);
    let query_id = read_u64(p, 2)?;
    let (query, _) = read_length_prefixed_string(p, 10)?;
    Ok(ShortInfoQuery {
        return_port,
        query_id,
        query,
    })
}

fn decode_short_info_reply(p: &[u8]) -> Result<ShortInfoReply, ProtocolError> {
    require_len(p, 8, "ShortInfoReply")?;
    let query_id = read_u64(p, 0)?;
    let (info, _) = read_long_string(p, 8)?;
    Ok(ShortInfoReply { query_id, info })
}

fn decode_feed_request(p: &[u8]) -> Result<StreamFeedRequest, ProtocolError> {
    require_len(p, 15, "StreamFeedRequest")?;
    let protocol_version = read_u32(p, 0)?;
    let channel_format = ChannelFormat::try_from(p[4])
        .map_err(|b| ProtocolError::MalformedPayload(format!("unknown channel format: {b}")))?;
    let byte_order = decode_byte_order(p[5])?;
    let transport = decode_transport(p[6])?;
    let max_buflen = read_u32(p, 7)?;
    let max_chunklen = read_u32(p, 11)?;
    let (uid, _) = read_length_prefixed_string(p, 15)?;
    Ok(StreamFeedRequest {
        protocol_version,
        uid,
        channel_format,
        byte_order,
        transport,
        max_buflen,
        max_chunklen,
    })
}

fn decode_feed_response(p: &[u8]) -> Result<StreamFeedResponse, ProtocolError> {
    require_len(p, 8, "StreamFeedResponse")?;
    let code = u16::from_be_bytes([p[0], p[1]]);
    let status = FeedStatus::try_from(code)
        .map_err(|c| ProtocolError::MalformedPayload(format!("unknown feed status: {c}")))?;
    let protocol_version = read_u32(p, 2)?;
    let byte_order = decode_byte_order(p[6])?;
    let transport = decode_transport(p[7])?;
    let (message, _) = read_length_prefixed_string(p, 8)?;
    Ok(StreamFeedResponse {
        status,
        protocol_version,
        byte_order,
        transport,
        message,
    })
}

fn decode_error(p: &[u8]) -> Result<ErrorMessage, ProtocolError> {
    require_len(p, 2, "Error")?;
    let code = u16::from_be_bytes([p[0], p[1]]);
    let (description, _) = read_length_prefixed_string(p, 2)?;
    Ok(ErrorMessage { code, description })
}

fn decode_byte_order(b: u8) -> Result<ByteOrder, ProtocolError> {
    ByteOrder::try_from(b)
        .map_err(|b| ProtocolError::MalformedPayload(format!("unknown byte order: {b}")))
}

fn decode_transport(b: u8) -> Result<TransportMode, ProtocolError> {
    TransportMode::try_from(b)
        .map_err(|b| ProtocolError::MalformedPayload(format!("unknown transport mode: {b}")))
}

// ── Primitive helpers ─────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], ProtocolError> {
    buf.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: offset + N,
            available: buf.len(),
        })
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    read_array(buf, offset).map(u32::from_be_bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, ProtocolError> {
    read_array(buf, offset).map(u64::from_be_bytes)
}

fn read_f64(buf: &[u8], offset: usize) -> Result<f64, ProtocolError> {
    read_array(buf, offset).map(f64::from_be_bytes)
}

fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| {
        ProtocolError::MalformedPayload(format!("string of {} bytes exceeds u16 prefix", s.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_long_string(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let len = u32::try_from(s.len()).map_err(|_| {
        ProtocolError::MalformedPayload(format!("string of {} bytes exceeds u32 prefix", s.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_prefixed(buf: &[u8], start: usize, len: usize) -> Result<(String, usize), ProtocolError> {
    let bytes = buf.get(start..start.saturating_add(len)).ok_or_else(|| {
        ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        ))
    })?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    let len = u16::from_be_bytes(read_array(buf, offset)?) as usize;
    read_prefixed(buf, offset + 2, len)
}

fn read_long_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    let len = read_u32(buf, offset)? as usize;
    read_prefixed(buf, offset + 4, len)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
