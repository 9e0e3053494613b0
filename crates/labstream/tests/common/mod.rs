//! Shared setup for the integration tests.
//!
//! Every test gets its own session id, so outlets of concurrently running
//! tests never answer each other's queries.  Discovery goes over loopback
//! unicast to the outlet port range; no multicast route is needed.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use labstream::infrastructure::config::Ipv6Mode;
use labstream::ApiConfig;
use uuid::Uuid;

/// Generous bound for anything that goes over the network.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

pub fn lab_config() -> Arc<ApiConfig> {
    let mut config = ApiConfig::default();
    config.ports.ipv6 = Ipv6Mode::Disable;
    config.multicast.addresses_override = Some(vec!["127.0.0.1".to_string()]);
    config.lab.known_peers = vec!["127.0.0.1".to_string()];
    config.lab.session_id = format!("it-{}", Uuid::new_v4());
    Arc::new(config)
}

/// Polls `condition` every 50 ms until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
