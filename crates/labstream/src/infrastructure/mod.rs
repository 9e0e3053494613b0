//! Infrastructure layer: configuration, logging, the private I/O runtime and
//! all network code.
//!
//! **Dependency rule**: this layer may depend on `labstream_core`, but MUST
//! NOT import the `application` layer.
//!
//! # Sub-modules
//!
//! - **`config`** – the TOML process configuration ([`config::ApiConfig`]).
//! - **`logging`** – `tracing` subscriber installation.
//! - **`runtime`** – the per-object Tokio runtime and the blocking bridge
//!   into it.
//! - **`network`** – sockets, discovery, data feeds and time sync.

pub mod config;
pub mod logging;
pub mod network;
pub mod runtime;
