//! TOML-based process configuration.
//!
//! One read-only [`ApiConfig`] is loaded per process and shared by every
//! outlet, inlet and resolver.  The file is looked up in this order:
//!
//! 1. the path in the `LABSTREAM_CONFIG` environment variable,
//! 2. `./labstream.toml`,
//! 3. the platform config directory:
//!    - Windows:  `%APPDATA%\labstream\labstream.toml`
//!    - Linux:    `~/.config/labstream/labstream.toml`
//!    - macOS:    `~/Library/Application Support/labstream/labstream.toml`
//! 4. built-in defaults.
//!
//! Example:
//!
//! ```toml
//! [ports]
//! base_port = 16572
//! ipv6 = "disable"
//!
//! [multicast]
//! resolve_scope = "link"
//!
//! [lab]
//! known_peers = ["10.0.0.12", "10.0.0.13"]
//! session_id = "experiment-7"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, so an empty file, a
//! file with a single section, or a file from an older version all load.
//! Every constructor in this crate also has a `*_with_config` form taking an
//! explicit `Arc<ApiConfig>`, which is how tests isolate themselves.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "LABSTREAM_CONFIG";

/// File name looked up in the working and platform config directories.
pub const CONFIG_FILE_NAME: &str = "labstream.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub lab: LabConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Whether sockets use IPv4, IPv6 or both.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Ipv6Mode {
    /// IPv4 only.
    #[serde(alias = "disabled")]
    Disable,
    /// Both families.
    #[default]
    #[serde(alias = "allowed")]
    Allow,
    /// IPv6 only.
    #[serde(alias = "forced")]
    Force,
}

/// How far discovery queries travel.
///
/// Each wider scope includes the addresses of every narrower one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolveScope {
    Machine,
    Link,
    #[default]
    Site,
    Organization,
    Global,
}

impl ResolveScope {
    /// Multicast TTL conventionally used for the scope.
    pub fn ttl(self) -> u32 {
        match self {
            ResolveScope::Machine => 0,
            ResolveScope::Link => 1,
            ResolveScope::Site => 24,
            ResolveScope::Organization => 32,
            ResolveScope::Global => 255,
        }
    }
}

/// Port allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortsConfig {
    /// UDP port every outlet's multicast responder listens on.
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    /// First port of the range outlets bind their service sockets in.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Number of ports in the range.
    #[serde(default = "default_port_range")]
    pub port_range: u16,
    /// Fall back to an OS-assigned port once the range is exhausted.
    #[serde(default = "default_true")]
    pub allow_random_ports: bool,
    #[serde(default)]
    pub ipv6: Ipv6Mode,
}

/// Discovery address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MulticastConfig {
    #[serde(default)]
    pub resolve_scope: ResolveScope,
    /// Local interface address multicast groups are joined on; empty means
    /// any interface.
    #[serde(default)]
    pub listen_address: String,
    /// Group id appended to the scope prefix of IPv6 multicast addresses.
    #[serde(default = "default_ipv6_group")]
    pub ipv6_multicast_group: String,
    #[serde(default = "default_machine_addresses")]
    pub machine_addresses: Vec<String>,
    #[serde(default = "default_link_addresses")]
    pub link_addresses: Vec<String>,
    #[serde(default = "default_site_addresses")]
    pub site_addresses: Vec<String>,
    #[serde(default)]
    pub organization_addresses: Vec<String>,
    #[serde(default)]
    pub global_addresses: Vec<String>,
    /// Replaces the scope's TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_override: Option<u32>,
    /// Replaces the scope's address list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses_override: Option<Vec<String>>,
}

/// Lab-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabConfig {
    /// Hosts queried by unicast in addition to multicast, for networks
    /// where multicast does not reach.
    #[serde(default)]
    pub known_peers: Vec<String>,
    /// Streams are only visible to resolvers of the same session.
    #[serde(default = "default_session_id")]
    pub session_id: String,
}

/// Timing and sizing knobs.  All durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuningConfig {
    #[serde(default = "default_multicast_min_rtt")]
    pub multicast_min_rtt: f64,
    #[serde(default = "default_multicast_max_rtt")]
    pub multicast_max_rtt: f64,
    #[serde(default = "default_unicast_min_rtt")]
    pub unicast_min_rtt: f64,
    #[serde(default = "default_unicast_max_rtt")]
    pub unicast_max_rtt: f64,
    /// Extra pause between waves of a continuous resolver.
    #[serde(default = "default_continuous_resolve_interval")]
    pub continuous_resolve_interval: f64,
    /// Query verdicts each outlet remembers.
    #[serde(default = "default_max_cached_queries")]
    pub max_cached_queries: usize,
    #[serde(default = "default_time_update_interval")]
    pub time_update_interval: f64,
    #[serde(default = "default_time_probe_count")]
    pub time_probe_count: u32,
    #[serde(default = "default_time_probe_interval")]
    pub time_probe_interval: f64,
    #[serde(default = "default_time_probe_max_rtt")]
    pub time_probe_max_rtt: f64,
    #[serde(default = "default_time_update_min_probes")]
    pub time_update_min_probes: usize,
    /// Size of the minimum-round-trip probe subset.
    #[serde(default = "default_time_probe_keep")]
    pub time_probe_keep: usize,
    /// Half-time of the dejitter regression.
    #[serde(default = "default_smoothing_halftime")]
    pub smoothing_halftime: f64,
    /// Ignore caller timestamps and stamp samples on push.
    #[serde(default)]
    pub force_default_timestamps: bool,
    /// Outlet send buffer size in milliseconds of data (regular streams).
    #[serde(default = "default_buffer_reserve_ms")]
    pub outlet_buffer_reserve_ms: u32,
    /// Outlet send buffer size in samples (irregular streams).
    #[serde(default = "default_buffer_reserve_samples")]
    pub outlet_buffer_reserve_samples: u32,
    #[serde(default = "default_buffer_reserve_ms")]
    pub inlet_buffer_reserve_ms: u32,
    #[serde(default = "default_buffer_reserve_samples")]
    pub inlet_buffer_reserve_samples: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_multicast_port() -> u16 {
    16571
}
fn default_base_port() -> u16 {
    16572
}
fn default_port_range() -> u16 {
    32
}
fn default_true() -> bool {
    true
}
fn default_ipv6_group() -> String {
    "113D:6FDD:2C17:A643:FFE2:1BD1:3CD2".to_string()
}
fn default_machine_addresses() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}
fn default_link_addresses() -> Vec<String> {
    ["255.255.255.255", "224.0.0.1", "224.0.0.183"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_site_addresses() -> Vec<String> {
    vec!["239.255.172.215".to_string()]
}
fn default_session_id() -> String {
    "default".to_string()
}
fn default_multicast_min_rtt() -> f64 {
    0.5
}
fn default_multicast_max_rtt() -> f64 {
    3.0
}
fn default_unicast_min_rtt() -> f64 {
    0.75
}
fn default_unicast_max_rtt() -> f64 {
    5.0
}
fn default_continuous_resolve_interval() -> f64 {
    0.5
}
fn default_max_cached_queries() -> usize {
    100
}
fn default_time_update_interval() -> f64 {
    2.0
}
fn default_time_probe_count() -> u32 {
    8
}
fn default_time_probe_interval() -> f64 {
    0.064
}
fn default_time_probe_max_rtt() -> f64 {
    0.128
}
fn default_time_update_min_probes() -> usize {
    6
}
fn default_time_probe_keep() -> usize {
    3
}
fn default_smoothing_halftime() -> f64 {
    90.0
}
fn default_buffer_reserve_ms() -> u32 {
    5000
}
fn default_buffer_reserve_samples() -> u32 {
    128
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            multicast_port: default_multicast_port(),
            base_port: default_base_port(),
            port_range: default_port_range(),
            allow_random_ports: default_true(),
            ipv6: Ipv6Mode::default(),
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            resolve_scope: ResolveScope::default(),
            listen_address: String::new(),
            ipv6_multicast_group: default_ipv6_group(),
            machine_addresses: default_machine_addresses(),
            link_addresses: default_link_addresses(),
            site_addresses: default_site_addresses(),
            organization_addresses: Vec::new(),
            global_addresses: Vec::new(),
            ttl_override: None,
            addresses_override: None,
        }
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            known_peers: Vec::new(),
            session_id: default_session_id(),
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            multicast_min_rtt: default_multicast_min_rtt(),
            multicast_max_rtt: default_multicast_max_rtt(),
            unicast_min_rtt: default_unicast_min_rtt(),
            unicast_max_rtt: default_unicast_max_rtt(),
            continuous_resolve_interval: default_continuous_resolve_interval(),
            max_cached_queries: default_max_cached_queries(),
            time_update_interval: default_time_update_interval(),
            time_probe_count: default_time_probe_count(),
            time_probe_interval: default_time_probe_interval(),
            time_probe_max_rtt: default_time_probe_max_rtt(),
            time_update_min_probes: default_time_update_min_probes(),
            time_probe_keep: default_time_probe_keep(),
            smoothing_halftime: default_smoothing_halftime(),
            force_default_timestamps: false,
            outlet_buffer_reserve_ms: default_buffer_reserve_ms(),
            outlet_buffer_reserve_samples: default_buffer_reserve_samples(),
            inlet_buffer_reserve_ms: default_buffer_reserve_ms(),
            inlet_buffer_reserve_samples: default_buffer_reserve_samples(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl ApiConfig {
    pub fn allow_ipv4(&self) -> bool {
        self.ports.ipv6 != Ipv6Mode::Force
    }

    pub fn allow_ipv6(&self) -> bool {
        self.ports.ipv6 != Ipv6Mode::Disable
    }

    /// Multicast TTL for the configured scope, or the override.
    pub fn multicast_ttl(&self) -> u32 {
        self.multicast
            .ttl_override
            .unwrap_or_else(|| self.multicast.resolve_scope.ttl())
    }

    /// Addresses discovery waves are sent to, filtered by the enabled IP
    /// families.  Entries that do not parse are logged and skipped.
    pub fn multicast_addresses(&self) -> Vec<IpAddr> {
        let m = &self.multicast;
        let names: Vec<String> = match &m.addresses_override {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                let scope = m.resolve_scope;
                let v6 = |prefix: &str| format!("{prefix}:{}", m.ipv6_multicast_group);
                let mut names = m.machine_addresses.clone();
                if scope >= ResolveScope::Link {
                    names.extend(m.link_addresses.iter().cloned());
                    names.push(v6("FF02"));
                }
                if scope >= ResolveScope::Site {
                    names.extend(m.site_addresses.iter().cloned());
                    names.push(v6("FF05"));
                }
                if scope >= ResolveScope::Organization {
                    names.extend(m.organization_addresses.iter().cloned());
                    names.push(v6("FF08"));
                }
                if scope >= ResolveScope::Global {
                    names.extend(m.global_addresses.iter().cloned());
                    names.push(v6("FF0E"));
                }
                names
            }
        };

        names
            .iter()
            .filter_map(|name| match name.trim().parse::<IpAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("ignoring multicast address {name:?}: {e}");
                    None
                }
            })
            .filter(|addr| match addr {
                IpAddr::V4(_) => self.allow_ipv4(),
                IpAddr::V6(_) => self.allow_ipv6(),
            })
            .collect()
    }

    /// The local interface address for multicast joins, if configured.
    pub fn listen_address(&self) -> Option<IpAddr> {
        let text = self.multicast.listen_address.trim();
        if text.is_empty() {
            return None;
        }
        match text.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("ignoring listen_address {text:?}: {e}");
                None
            }
        }
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if the TOML is malformed.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Serializes to a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Serialize`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is malformed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Loads the first configuration file found in the lookup order, or
    /// the defaults if there is none.
    ///
    /// # Errors
    ///
    /// Fails if `LABSTREAM_CONFIG` names an unreadable file or if the file
    /// found is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }
        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE_NAME))
            .chain(platform_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME)));
        for path in candidates {
            if path.is_file() {
                debug!("loading configuration from {}", path.display());
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// The process-wide configuration, loaded on first use.
    ///
    /// A configuration that fails to load is logged and replaced by the
    /// defaults.
    pub fn shared() -> Arc<ApiConfig> {
        static SHARED: OnceLock<Arc<ApiConfig>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| {
            Arc::new(Self::load().unwrap_or_else(|e| {
                warn!("falling back to default configuration: {e}");
                Self::default()
            }))
        }))
    }
}

/// Resolves the platform config directory including the `labstream`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("labstream"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("labstream"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("labstream")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
