//! `tracing` subscriber installation.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! the application installs a subscriber.  [`init_logging`] is a convenience
//! for applications that do not set one up themselves.

use tracing_subscriber::EnvFilter;

use crate::infrastructure::config::LogConfig;

/// Installs a formatting subscriber filtered by `RUST_LOG`, or by
/// `config.level` when `RUST_LOG` is unset or invalid.
///
/// Returns `true` if this call installed the subscriber and `false` if one
/// was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_already_installed() {
        // Arrange
        let config = LogConfig::default();

        // Act
        let _ = init_logging(&config);
        let second = init_logging(&config);

        // Assert
        assert!(!second);
    }
}
