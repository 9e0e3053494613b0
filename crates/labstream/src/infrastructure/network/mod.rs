//! Sockets and wire traffic for outlets, inlets and resolvers.
//!
//! Everything in here runs on an object's private [`IoRuntime`]; the public
//! API in `application` only ever blocks on results handed back from these
//! tasks.
//!
//! # Sub-modules
//!
//! - **`sockets`** – `socket2`-based binding: port ranges, IPv4/IPv6
//!   separation, multicast membership.
//! - **`framing`** – reading and writing 24-byte-header frames on TCP.
//! - **`udp_service`** – outlet side of discovery and time probes.
//! - **`data_server`** – outlet side of full-info requests and sample feeds.
//! - **`resolve_attempt`** – query waves and reply collection.
//! - **`inlet_connection`** – inlet endpoints and loss tracking.
//! - **`data_receiver`** / **`info_receiver`** / **`time_receiver`** – the
//!   three inlet-side channels to one outlet.
//!
//! [`IoRuntime`]: crate::infrastructure::runtime::IoRuntime

pub mod data_receiver;
pub mod data_server;
pub mod framing;
pub mod info_receiver;
pub mod inlet_connection;
pub mod resolve_attempt;
pub mod sockets;
pub mod time_receiver;
pub mod udp_service;
