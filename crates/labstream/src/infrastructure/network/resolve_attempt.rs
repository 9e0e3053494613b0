//! One discovery run: query waves out, short-info replies in.
//!
//! For every enabled IP family a query socket is bound on an ephemeral port.
//! Each wave sends the query once to every multicast / broadcast address on
//! the shared multicast port and once to every port of the outlet port range
//! on each known peer.  Replies are checked against the query id and the
//! predicate, stamped with the address they came from, and deduplicated by
//! uid in a shared [`ResultCache`].
//!
//! The run ends when `minimum` distinct streams are known (if `minimum` is
//! non-zero) or the window closes.  Without a window it never ends and the
//! caller drops the future, which is how continuous resolvers use it.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labstream_core::protocol::codec::{decode_message, encode_message};
use labstream_core::protocol::messages::ShortInfoQuery;
use labstream_core::time::Clock;
use labstream_core::{Query, ResultCache, StreamInfo, WireMessage};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::error::{Result, StreamError};
use crate::infrastructure::config::ApiConfig;
use crate::infrastructure::network::sockets::{bind_query_socket, enabled_families, IpFamily};
use crate::infrastructure::runtime::seconds;

/// Largest reply datagram accepted.
const MAX_DATAGRAM: usize = 65536;

/// Results shared between a resolve run and whoever reads them.
pub type SharedResults = Arc<Mutex<ResultCache>>;

/// Creates an empty result cache on `clock`.
pub fn new_results(clock: Arc<dyn Clock>) -> SharedResults {
    Arc::new(Mutex::new(ResultCache::new(clock)))
}

/// Time between two query waves.
pub fn wave_period(config: &ApiConfig, continuous: bool) -> Duration {
    let tuning = &config.tuning;
    let mut period = tuning.multicast_min_rtt;
    if !config.lab.known_peers.is_empty() {
        period += tuning.unicast_min_rtt;
    }
    if continuous {
        period += tuning.continuous_resolve_interval;
    }
    seconds(period)
}

/// Every address a wave of `family` goes to.
pub async fn wave_targets(config: &ApiConfig, family: IpFamily) -> Vec<SocketAddr> {
    let mut targets: Vec<SocketAddr> = config
        .multicast_addresses()
        .into_iter()
        .filter(|addr| IpFamily::of(addr) == family)
        .map(|addr| SocketAddr::new(addr, config.ports.multicast_port))
        .collect();

    for peer in &config.lab.known_peers {
        let hosts: Vec<IpAddr> = match tokio::net::lookup_host((peer.as_str(), 0)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                warn!("cannot resolve known peer {peer:?}: {e}");
                continue;
            }
        };
        for host in hosts.into_iter().filter(|h| IpFamily::of(h) == family) {
            let ports = &config.ports;
            for offset in 0..ports.port_range {
                if let Some(port) = ports.base_port.checked_add(offset) {
                    targets.push(SocketAddr::new(host, port));
                }
            }
        }
    }
    targets.sort();
    targets.dedup();
    targets
}

/// Runs discovery for `query` until `minimum` streams are in `results` or
/// `window` passes.  `window = None` runs until the future is dropped.
///
/// # Errors
///
/// [`StreamError::Io`] when no query socket could be bound at all.
pub async fn resolve(
    query: &Query,
    config: &ApiConfig,
    results: &SharedResults,
    minimum: usize,
    window: Option<Duration>,
    continuous: bool,
) -> Result<()> {
    let period = wave_period(config, continuous);
    let enough = Arc::new(Notify::new());
    let mut waves = JoinSet::new();
    let mut last_error = None;

    for family in enabled_families(config) {
        let socket = match bind_query_socket(config, family).and_then(UdpSocket::from_std) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("no {family:?} query socket: {e}");
                last_error = Some(e);
                continue;
            }
        };
        let targets = wave_targets(config, family).await;
        trace!("{family:?} query waves go to {} targets", targets.len());
        waves.spawn(query_loop(
            socket,
            targets,
            query.clone(),
            Arc::clone(results),
            minimum,
            period,
            Arc::clone(&enough),
        ));
    }
    if waves.is_empty() {
        return Err(StreamError::Io(last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Unsupported, "no IP family is enabled")
        })));
    }

    let wait_window = async {
        match window {
            Some(window) => tokio::time::sleep(window).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = wait_window => {}
        _ = enough.notified() => {}
    }
    waves.abort_all();
    Ok(())
}

async fn query_loop(
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    query: Query,
    results: SharedResults,
    minimum: usize,
    period: Duration,
    enough: Arc<Notify>,
) {
    let return_port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            warn!("query socket has no local address: {e}");
            return;
        }
    };
    let datagram = match encode_message(
        &WireMessage::ShortInfoQuery(ShortInfoQuery {
            return_port,
            query_id: query.id(),
            query: query.text().to_string(),
        }),
        0,
        0,
    ) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("cannot encode query {:?}: {e}", query.text());
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut next_wave = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_wave) => {
                for target in &targets {
                    if let Err(e) = socket.send_to(&datagram, target).await {
                        trace!("query to {target} failed: {e}");
                    }
                }
                next_wave += period;
            }
            received = socket.recv_from(&mut buf) => {
                let Ok((len, src)) = received else {
                    continue;
                };
                let Some(info) = accept_reply(&buf[..len], src, &query) else {
                    continue;
                };
                let known = {
                    let mut cache = results.lock().unwrap_or_else(|p| p.into_inner());
                    if cache.insert(info) {
                        debug!("discovered stream via {src}");
                    }
                    cache.len()
                };
                if minimum > 0 && known >= minimum {
                    enough.notify_one();
                }
            }
        }
    }
}

/// Decodes one reply and fills in the address it came from.
fn accept_reply(datagram: &[u8], src: SocketAddr, query: &Query) -> Option<StreamInfo> {
    let reply = match decode_message(datagram) {
        Ok((WireMessage::ShortInfoReply(reply), _)) => reply,
        Ok(_) => return None,
        Err(e) => {
            trace!("undecodable reply from {src}: {e}");
            return None;
        }
    };
    if reply.query_id != query.id() {
        return None;
    }
    let mut info = match StreamInfo::from_message(&reply.info) {
        Ok(info) => info,
        Err(e) => {
            debug!("unparsable short info from {src}: {e}");
            return None;
        }
    };
    if !query.matches(&info) {
        return None;
    }
    let address = src.ip().to_canonical().to_string();
    match src.ip().to_canonical() {
        IpAddr::V4(_) => info.set_v4address(&address),
        IpAddr::V6(_) => info.set_v6address(&address),
    }
    Some(info)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
