//! The inlet's view of one outlet: where to reach it, and whether it is
//! still there.
//!
//! An [`InletConnection`] is shared by the data receiver, the info receiver
//! and the time receiver of one inlet.  Whichever of them first notices the
//! outlet is gone calls [`InletConnection::mark_lost`]; from then on every
//! blocked call registered at the connection's loss registry wakes up and
//! every later call fails fast with [`StreamError::ConnectionLost`].
//!
//! A lost connection stays lost.  Reconnecting to a restarted outlet is up
//! to the caller: resolve the stream again and open a new inlet.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use labstream_core::cancellation::{Cancellable, CancellableOperation, RegistryRef};
use labstream_core::{CancellationRegistry, StreamInfo};
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::infrastructure::config::ApiConfig;
use crate::infrastructure::network::sockets::IpFamily;

/// Endpoints and liveness of the outlet an inlet reads from.
pub struct InletConnection {
    info: StreamInfo,
    config: Arc<ApiConfig>,
    data_addr: SocketAddr,
    service_addr: SocketAddr,
    lost: AtomicBool,
    lost_reason: Mutex<Option<String>>,
    lost_registry: CancellationRegistry,
}

impl InletConnection {
    /// Picks the outlet's endpoints from `info`.
    ///
    /// IPv4 is preferred when allowed and advertised; IPv6 is used otherwise.
    /// An empty address means the outlet runs on this host.
    ///
    /// # Errors
    ///
    /// [`StreamError::Configuration`] when the descriptor advertises no
    /// endpoint usable under the configured IP mode.
    pub fn new(info: StreamInfo, config: Arc<ApiConfig>) -> Result<Self> {
        let (data_addr, service_addr) = select_endpoints(&info, &config)?;
        debug!(
            "inlet for {} uses data {data_addr}, service {service_addr}",
            info.name()
        );
        Ok(Self {
            info,
            config,
            data_addr,
            service_addr,
            lost: AtomicBool::new(false),
            lost_reason: Mutex::new(None),
            lost_registry: CancellationRegistry::new(),
        })
    }

    /// The descriptor the inlet was created from.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn config(&self) -> &Arc<ApiConfig> {
        &self.config
    }

    /// The outlet's TCP data endpoint.
    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// The outlet's UDP service endpoint (time probes).
    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Declares the outlet gone and wakes every registered wait.
    ///
    /// Only the first reason is kept.
    pub fn mark_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self
                .lost_reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                warn!("lost connection to {}: {reason}", self.info.name());
                *slot = Some(reason);
            }
        }
        self.lost.store(true, Ordering::Release);
        self.lost_registry.cancel_all();
    }

    /// Fails with [`StreamError::ConnectionLost`] once the outlet is gone.
    pub fn check(&self) -> Result<()> {
        if self.is_lost() {
            Err(self.lost_error())
        } else {
            Ok(())
        }
    }

    /// The error reported for a lost connection.
    pub fn lost_error(&self) -> StreamError {
        let reason = self
            .lost_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| "the outlet has disappeared".to_string());
        StreamError::ConnectionLost(reason)
    }

    /// Registry whose operations are cancelled when the connection is lost.
    pub fn lost_handle(&self) -> RegistryRef {
        self.lost_registry.handle()
    }

    /// Ties `target` to the connection: it is cancelled on loss, right away
    /// if the loss already happened.  The tie lasts as long as the returned
    /// operation.
    pub fn watch(&self, target: Arc<dyn Cancellable>) -> CancellableOperation {
        let operation = CancellableOperation::new(target);
        operation.register_at_ref(&self.lost_handle());
        if self.is_lost() {
            self.lost_registry.cancel_all();
        }
        operation
    }
}

impl std::fmt::Debug for InletConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InletConnection")
            .field("stream", &self.info.name())
            .field("data_addr", &self.data_addr)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

fn parse_host(address: &str, family: IpFamily) -> Result<IpAddr> {
    if address.is_empty() {
        return Ok(family.loopback());
    }
    let ip: IpAddr = address.parse().map_err(|_| {
        StreamError::Configuration(format!("advertised address {address:?} is not an IP address"))
    })?;
    if IpFamily::of(&ip) != family {
        return Err(StreamError::Configuration(format!(
            "advertised address {address} is not an {family:?} address"
        )));
    }
    Ok(ip)
}

fn select_endpoints(info: &StreamInfo, config: &ApiConfig) -> Result<(SocketAddr, SocketAddr)> {
    if config.allow_ipv4() && info.v4data_port() != 0 {
        let ip = parse_host(info.v4address(), IpFamily::V4)?;
        return Ok((
            SocketAddr::new(ip, info.v4data_port()),
            SocketAddr::new(ip, info.v4service_port()),
        ));
    }
    if config.allow_ipv6() && info.v6data_port() != 0 {
        let ip = parse_host(info.v6address(), IpFamily::V6)?;
        return Ok((
            SocketAddr::new(ip, info.v6data_port()),
            SocketAddr::new(ip, info.v6service_port()),
        ));
    }
    Err(StreamError::Configuration(format!(
        "stream {} advertises no endpoint reachable with the configured IP mode",
        info.name()
    )))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::Ipv6Mode;
    use labstream_core::cancellation::WaitSlot;
    use labstream_core::ChannelFormat;

    fn make_info() -> StreamInfo {
        StreamInfo::new("EEG", "eeg", 4, 100.0, ChannelFormat::Float32, "amp").expect("info")
    }

    #[test]
    fn test_empty_v4_address_means_loopback() {
        // Arrange
        let mut info = make_info();
        info.set_v4ports(17000, 17001);

        // Act
        let conn = InletConnection::new(info, Arc::new(ApiConfig::default())).expect("connection");

        // Assert
        assert_eq!(conn.data_addr(), "127.0.0.1:17000".parse::<SocketAddr>().expect("addr"));
        assert_eq!(conn.service_addr().port(), 17001);
    }

    #[test]
    fn test_v6_endpoint_used_when_v4_is_not_advertised() {
        let mut info = make_info();
        info.set_v6address("::1");
        info.set_v6ports(17002, 17003);

        let conn = InletConnection::new(info, Arc::new(ApiConfig::default())).expect("connection");

        assert_eq!(conn.data_addr(), "[::1]:17002".parse::<SocketAddr>().expect("addr"));
    }

    #[test]
    fn test_no_usable_endpoint_is_a_configuration_error() {
        // Arrange – only IPv6 advertised, IPv6 disabled
        let mut info = make_info();
        info.set_v6ports(17002, 17003);
        let mut config = ApiConfig::default();
        config.ports.ipv6 = Ipv6Mode::Disable;

        // Act
        let result = InletConnection::new(info, Arc::new(config));

        // Assert
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }

    #[test]
    fn test_mark_lost_keeps_first_reason_and_cancels_watchers() {
        // Arrange
        let mut info = make_info();
        info.set_v4ports(17000, 17001);
        let conn = InletConnection::new(info, Arc::new(ApiConfig::default())).expect("connection");
        let slot = Arc::new(WaitSlot::new(()));
        let _tie = conn.watch(Arc::clone(&slot) as Arc<dyn Cancellable>);

        // Act
        conn.mark_lost("peer closed");
        conn.mark_lost("second reason");

        // Assert
        assert!(slot.is_cancelled());
        match conn.check() {
            Err(StreamError::ConnectionLost(reason)) => assert_eq!(reason, "peer closed"),
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
    }

    #[test]
    fn test_watch_after_loss_cancels_immediately() {
        let mut info = make_info();
        info.set_v4ports(17000, 17001);
        let conn = InletConnection::new(info, Arc::new(ApiConfig::default())).expect("connection");
        conn.mark_lost("gone");
        let slot = Arc::new(WaitSlot::new(()));

        let _tie = conn.watch(Arc::clone(&slot) as Arc<dyn Cancellable>);

        assert!(slot.is_cancelled());
    }
}
