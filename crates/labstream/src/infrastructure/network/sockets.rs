//! Socket construction for outlets, inlets and resolvers.
//!
//! Everything is built with `socket2` and converted into standard-library
//! sockets, which the callers hand to Tokio.  `socket2` is needed for the
//! options `std::net` does not expose: address reuse on the shared multicast
//! port, `IPV6_V6ONLY` so an IPv4 and an IPv6 socket can share a port
//! number, and multicast TTL / loopback.
//!
//! # Port allocation
//!
//! Outlets bind their service sockets in `[base_port, base_port +
//! port_range)` so that resolvers configured with `known_peers` can reach
//! them by unicast.  Once the range is exhausted a random port is used if
//! `allow_random_ports` is set; such outlets are then only discoverable by
//! multicast.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::infrastructure::config::ApiConfig;

/// TCP listen backlog.
const LISTEN_BACKLOG: i32 = 128;

/// An IP protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// The wildcard address of the family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// The loopback address of the family.
    pub fn loopback(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// The families enabled by the `ipv6` setting, IPv4 first.
pub fn enabled_families(config: &ApiConfig) -> Vec<IpFamily> {
    let mut families = Vec::with_capacity(2);
    if config.allow_ipv4() {
        families.push(IpFamily::V4);
    }
    if config.allow_ipv6() {
        families.push(IpFamily::V6);
    }
    families
}

fn new_socket(family: IpFamily, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let domain = match family {
        IpFamily::V4 => Domain::IPV4,
        IpFamily::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    if family == IpFamily::V6 {
        socket.set_only_v6(true)?;
    }
    Ok(socket)
}

/// Tries every port of the configured range, then a random port if allowed.
fn bind_in_port_range<T>(
    config: &ApiConfig,
    family: IpFamily,
    mut bind: impl FnMut(SocketAddr) -> io::Result<T>,
) -> io::Result<T> {
    let ports = &config.ports;
    let mut last_error = None;
    for offset in 0..ports.port_range {
        let Some(port) = ports.base_port.checked_add(offset) else {
            break;
        };
        match bind(SocketAddr::new(family.unspecified(), port)) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    if ports.allow_random_ports {
        debug!("port range exhausted; binding a random {family:?} port");
        return bind(SocketAddr::new(family.unspecified(), 0));
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "configured port range is empty")
    }))
}

/// Binds a non-blocking TCP listener for an outlet's data server.
///
/// # Errors
///
/// The last bind error when no port could be bound.
pub fn bind_tcp_listener(config: &ApiConfig, family: IpFamily) -> io::Result<TcpListener> {
    bind_in_port_range(config, family, |addr| {
        let socket = new_socket(family, Type::STREAM, Protocol::TCP)?;
        #[cfg(unix)]
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
}

/// Binds a non-blocking UDP socket for an outlet's unicast service
/// (discovery replies and time probes).
///
/// # Errors
///
/// The last bind error when no port could be bound.
pub fn bind_service_socket(config: &ApiConfig, family: IpFamily) -> io::Result<UdpSocket> {
    bind_in_port_range(config, family, |addr| {
        let socket = new_socket(family, Type::DGRAM, Protocol::UDP)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
}

/// Binds a non-blocking UDP socket on the shared multicast port and joins
/// every configured multicast group of `family`.
///
/// Several outlets on one host bind the same port, hence address reuse.
/// Groups that cannot be joined (no route, no interface) are logged and
/// skipped.
///
/// # Errors
///
/// Fails only if the socket itself cannot be created or bound.
pub fn bind_multicast_responder(config: &ApiConfig, family: IpFamily) -> io::Result<UdpSocket> {
    let socket = new_socket(family, Type::DGRAM, Protocol::UDP)?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::new(family.unspecified(), config.ports.multicast_port);
    socket.bind(&addr.into())?;

    let interface = config.listen_address();
    for group in config.multicast_addresses() {
        let joined = match (family, group) {
            (IpFamily::V4, IpAddr::V4(group)) if group.is_multicast() => {
                let iface = match interface {
                    Some(IpAddr::V4(iface)) => iface,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                socket.join_multicast_v4(&group, &iface)
            }
            (IpFamily::V6, IpAddr::V6(group)) if group.is_multicast() => {
                socket.join_multicast_v6(&group, 0)
            }
            _ => continue,
        };
        match joined {
            Ok(()) => debug!("joined multicast group {group}"),
            Err(e) => warn!("could not join multicast group {group}: {e}"),
        }
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Binds a non-blocking UDP socket on an ephemeral port for sending
/// discovery waves: broadcast enabled and multicast TTL set.
///
/// # Errors
///
/// Propagates socket creation and bind errors.
pub fn bind_query_socket(config: &ApiConfig, family: IpFamily) -> io::Result<UdpSocket> {
    let socket = new_socket(family, Type::DGRAM, Protocol::UDP)?;
    let ttl = config.multicast_ttl();
    match family {
        IpFamily::V4 => {
            socket.set_broadcast(true)?;
            socket.set_multicast_ttl_v4(ttl)?;
            socket.set_multicast_loop_v4(true)?;
        }
        IpFamily::V6 => {
            socket.set_multicast_hops_v6(ttl)?;
            socket.set_multicast_loop_v6(true)?;
        }
    }
    socket.bind(&SocketAddr::new(family.unspecified(), 0).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::Ipv6Mode;

    fn config_with_range(base_port: u16, port_range: u16, allow_random_ports: bool) -> ApiConfig {
        let mut config = ApiConfig::default();
        config.ports.base_port = base_port;
        config.ports.port_range = port_range;
        config.ports.allow_random_ports = allow_random_ports;
        config
    }

    #[test]
    fn test_enabled_families_follow_ipv6_mode() {
        let mut config = ApiConfig::default();

        config.ports.ipv6 = Ipv6Mode::Disable;
        assert_eq!(enabled_families(&config), vec![IpFamily::V4]);

        config.ports.ipv6 = Ipv6Mode::Allow;
        assert_eq!(enabled_families(&config), vec![IpFamily::V4, IpFamily::V6]);

        config.ports.ipv6 = Ipv6Mode::Force;
        assert_eq!(enabled_families(&config), vec![IpFamily::V6]);
    }

    #[test]
    fn test_service_socket_skips_taken_port() {
        // Arrange – occupy a port and make it the start of a two-port range
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").expect("probe bind");
        let base = taken.local_addr().expect("addr").port();
        let config = config_with_range(base, 2, true);

        // Act
        let socket = bind_service_socket(&config, IpFamily::V4).expect("bind");

        // Assert
        assert_ne!(socket.local_addr().expect("addr").port(), base);
    }

    #[test]
    fn test_exhausted_range_without_random_ports_fails() {
        // Arrange
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").expect("probe bind");
        let base = taken.local_addr().expect("addr").port();
        let config = config_with_range(base, 1, false);

        // Act
        let result = bind_service_socket(&config, IpFamily::V4);

        // Assert
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_range_falls_back_to_random_port() {
        let config = config_with_range(40000, 0, true);

        let listener = bind_tcp_listener(&config, IpFamily::V4).expect("bind");

        assert_ne!(listener.local_addr().expect("addr").port(), 0);
    }

    #[test]
    fn test_query_socket_binds_ephemeral_port() {
        let config = ApiConfig::default();

        let socket = bind_query_socket(&config, IpFamily::V4).expect("bind");

        assert_ne!(socket.local_addr().expect("addr").port(), 0);
    }
}
