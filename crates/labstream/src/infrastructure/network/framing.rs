//! Reading and writing framed messages on TCP streams.
//!
//! A frame is the 24-byte header followed by `payload_len` bytes.  The
//! reader pulls the header first, checks the declared length against
//! [`MAX_PAYLOAD_LEN`] before allocating, then pulls the payload.

use labstream_core::protocol::codec::{decode_header, decode_payload, encode_message, MessageHeader};
use labstream_core::protocol::messages::{HEADER_SIZE, MAX_PAYLOAD_LEN};
use labstream_core::time::Clock;
use labstream_core::{ProtocolError, WireMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;

/// Header timestamp for a message sent now.
pub fn timestamp_us(clock: &dyn Clock) -> u64 {
    (clock.now() * 1e6) as u64
}

/// Reads one frame.  Returns `Ok(None)` on a clean end of stream before the
/// first header byte.
///
/// # Errors
///
/// [`StreamError::Io`] for transport errors and truncated frames,
/// [`StreamError::Protocol`] for undecodable or oversized frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(MessageHeader, WireMessage)>, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    let first = reader.read(&mut header_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header_buf[first..]).await?;

    let header = decode_header(&header_buf)?;
    if header.payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            declared: header.payload_len,
            max: MAX_PAYLOAD_LEN,
        }
        .into());
    }

    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload).await?;
    let message = decode_payload(&header, &payload)?;
    Ok(Some((header, message)))
}

/// Encodes and writes one message.
///
/// # Errors
///
/// [`StreamError::Protocol`] if the message cannot be encoded and
/// [`StreamError::Io`] if the write fails.
pub async fn write_message<W>(
    writer: &mut W,
    message: &WireMessage,
    sequence: u64,
    clock: &dyn Clock,
) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(message, sequence, timestamp_us(clock))?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use labstream_core::protocol::messages::ErrorMessage;
    use labstream_core::time::LocalClock;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex_pipe() {
        // Arrange
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = WireMessage::Error(ErrorMessage {
            code: 400,
            description: "bad".to_string(),
        });

        // Act
        write_message(&mut a, &msg, 7, &LocalClock).await.expect("write");
        drop(a);
        let first = read_frame(&mut b).await.expect("read");
        let second = read_frame(&mut b).await.expect("read eof");

        // Assert
        let (header, decoded) = first.expect("one frame");
        assert_eq!(header.sequence, 7);
        assert_eq!(decoded, msg);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_oversized_declared_payload_is_rejected_before_reading() {
        // Arrange – a valid header declaring a huge payload, and no payload
        let mut bytes = encode_message(&WireMessage::FullInfoRequest, 0, 0).expect("encode");
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = &bytes[..];

        // Act
        let result = read_frame(&mut reader).await;

        // Assert
        assert!(matches!(
            result,
            Err(StreamError::Protocol(ProtocolError::PayloadTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let bytes = encode_message(&WireMessage::FullInfoReply("x".repeat(10)), 0, 0).expect("encode");
        let mut reader = &bytes[..bytes.len() - 3];

        let result = read_frame(&mut reader).await;

        assert!(matches!(result, Err(StreamError::Io(_))));
    }
}
