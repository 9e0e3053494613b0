//! Fetches an outlet's full descriptor, description tree included.
//!
//! Discovery only carries the short descriptor.  The full one comes over a
//! separate TCP connection to the data server so a large description tree
//! never has to fit into a datagram.

use labstream_core::time::Clock;
use labstream_core::{StreamInfo, WireMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::infrastructure::network::framing::{read_frame, write_message};
use crate::infrastructure::network::inlet_connection::InletConnection;

/// Requests the full descriptor over an open stream.
///
/// # Errors
///
/// [`StreamError::ConnectionLost`] if the peer closes the stream, and
/// [`StreamError::Configuration`] if it answers with something else or with
/// a descriptor that does not parse.
pub async fn request_full_info<S>(stream: &mut S, clock: &dyn Clock) -> Result<StreamInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &WireMessage::FullInfoRequest, 0, clock).await?;
    match read_frame(stream).await? {
        Some((_, WireMessage::FullInfoReply(text))) => Ok(StreamInfo::from_message(&text)?),
        Some((_, other)) => Err(StreamError::Configuration(format!(
            "outlet answered the info request with {:?}",
            other.message_type()
        ))),
        None => Err(StreamError::ConnectionLost(
            "outlet closed the connection before sending its descriptor".to_string(),
        )),
    }
}

/// Connects to the outlet behind `conn` and fetches its full descriptor.
///
/// Address fields the outlet leaves empty are taken from the descriptor the
/// inlet was created with.
///
/// # Errors
///
/// As [`request_full_info`]; an unreachable outlet is
/// [`StreamError::ConnectionLost`].
pub async fn fetch(conn: &InletConnection, clock: &dyn Clock) -> Result<StreamInfo> {
    let addr = conn.data_addr();
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| StreamError::ConnectionLost(format!("cannot reach the outlet at {addr}: {e}")))?;
    let mut info = request_full_info(&mut stream, clock).await?;
    debug!("received full info of {} from {addr}", info.name());

    let known = conn.info();
    if info.v4address().is_empty() {
        info.set_v4address(known.v4address());
    }
    if info.v6address().is_empty() {
        info.set_v6address(known.v6address());
    }
    Ok(info)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use labstream_core::time::LocalClock;
    use labstream_core::ChannelFormat;

    #[tokio::test]
    async fn test_full_info_keeps_description_tree() {
        // Arrange – a fake outlet answering one info request
        let mut info = StreamInfo::new("Cap", "eeg", 2, 250.0, ChannelFormat::Float32, "cap-1")
            .expect("info");
        info.desc_mut()
            .append_child("channels")
            .append_child_value("label", "Fz\tCz\nPz");
        let text = info.to_fullinfo_message().expect("serialize");
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let request = read_frame(&mut server).await.expect("read").expect("frame");
            assert_eq!(request.1, WireMessage::FullInfoRequest);
            write_message(&mut server, &WireMessage::FullInfoReply(text), 0, &LocalClock)
                .await
                .expect("reply");
        });

        // Act
        let fetched = request_full_info(&mut client, &LocalClock).await;

        // Assert
        let fetched = fetched.expect("full info");
        assert_eq!(fetched.uid(), info.uid());
        let label = fetched
            .desc()
            .child("channels")
            .and_then(|c| c.child_value("label"));
        assert_eq!(label, Some("Fz\tCz\nPz"));
    }

    #[tokio::test]
    async fn test_closed_peer_is_connection_lost() {
        // Arrange – the peer reads the request and hangs up
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
        });

        // Act
        let result = request_full_info(&mut client, &LocalClock).await;

        // Assert
        assert!(matches!(result, Err(StreamError::ConnectionLost(_))));
    }
}
