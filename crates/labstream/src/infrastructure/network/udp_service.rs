//! Outlet-side UDP responder for discovery queries and time probes.
//!
//! Every outlet runs this loop on its unicast service socket and on its
//! multicast responder sockets.  Two datagrams are answered:
//!
//! - `ShortInfoQuery` – if the query matches the outlet's descriptor, a
//!   `ShortInfoReply` carrying the short-info text goes back to the
//!   sender's address on the `return_port` named in the query.
//! - `TimeProbe` – a `TimeReply` echoing the probe's send time together
//!   with the local receive and reply times goes straight back to the
//!   sender.
//!
//! Malformed datagrams and malformed queries are dropped without a reply
//! and without touching the query cache.
//!
//! # How a discovery exchange looks (for beginners)
//!
//! 1. A resolver sends `name='EEG'` (plus session scoping) to the multicast
//!    groups and to every port of the outlet port range on known peers.
//! 2. Every outlet that hears it evaluates the predicate against its own
//!    descriptor.  Only matching outlets answer.
//! 3. The resolver collects answers for a while, deduplicating by uid.

use std::net::SocketAddr;
use std::sync::Arc;

use labstream_core::protocol::codec::{decode_message, encode_message};
use labstream_core::protocol::messages::{ShortInfoReply, TimeReply};
use labstream_core::protocol::SequenceCounter;
use labstream_core::query::cache::QueryCache;
use labstream_core::time::Clock;
use labstream_core::{StreamInfo, WireMessage};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::infrastructure::network::framing::timestamp_us;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65536;

/// What an outlet answers with.
pub struct ServiceContext {
    pub info: StreamInfo,
    /// `info` serialized as short info, with the outlet's ports filled in.
    pub shortinfo: String,
    pub max_cached_queries: usize,
    pub clock: Arc<dyn Clock>,
}

/// Per-socket responder state.
pub struct Responder {
    context: Arc<ServiceContext>,
    cache: QueryCache,
}

impl Responder {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        let cache = QueryCache::new(context.max_cached_queries);
        Self { context, cache }
    }

    /// Computes the reply to one datagram received from `src` at local time
    /// `received_at`, with its destination.
    pub fn respond(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
        received_at: f64,
    ) -> Option<(WireMessage, SocketAddr)> {
        let message = match decode_message(datagram) {
            Ok((message, _)) => message,
            Err(e) => {
                debug!("dropping undecodable datagram from {src}: {e}");
                return None;
            }
        };

        match message {
            WireMessage::ShortInfoQuery(query) => {
                match self.cache.matches(&query.query, &self.context.info) {
                    Ok(true) => {
                        trace!("query {:016x} from {src} matched", query.query_id);
                        let reply = WireMessage::ShortInfoReply(ShortInfoReply {
                            query_id: query.query_id,
                            info: self.context.shortinfo.clone(),
                        });
                        Some((reply, SocketAddr::new(src.ip(), query.return_port)))
                    }
                    Ok(false) => None,
                    Err(e) => {
                        debug!("rejecting malformed query from {src}: {e}");
                        None
                    }
                }
            }
            WireMessage::TimeProbe(probe) => {
                let reply = WireMessage::TimeReply(TimeReply {
                    wave_id: probe.wave_id,
                    t0: probe.t0,
                    t1: received_at,
                    t2: self.context.clock.now(),
                });
                Some((reply, src))
            }
            other => {
                debug!(
                    "unexpected {:?} on service socket from {src}",
                    other.message_type()
                );
                None
            }
        }
    }
}

/// Answers datagrams on `socket` until `shutdown` flips.
pub async fn serve(socket: UdpSocket, context: Arc<ServiceContext>, mut shutdown: watch::Receiver<bool>) {
    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!("UDP service listening on {local}");

    let clock = Arc::clone(&context.clock);
    let mut responder = Responder::new(context);
    let sequence = SequenceCounter::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; they do not affect the socket.
                    debug!("UDP service recv error on {local}: {e}");
                    continue;
                }
            },
        };
        let received_at = clock.now();

        let Some((reply, dest)) = responder.respond(&buf[..len], src, received_at) else {
            continue;
        };
        match encode_message(&reply, sequence.next(), timestamp_us(clock.as_ref())) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, dest).await {
                    warn!("failed to send {:?} to {dest}: {e}", reply.message_type());
                }
            }
            Err(e) => warn!("failed to encode {:?}: {e}", reply.message_type()),
        }
    }

    info!("UDP service on {local} stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
