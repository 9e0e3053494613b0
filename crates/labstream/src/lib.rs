//! # labstream
//!
//! Broker-less discovery and streaming of time-stamped multi-channel
//! samples between programs on a local network.
//!
//! # Architecture overview (for beginners)
//!
//! ```text
//!   producer program                         consumer program
//!  ┌──────────────────┐   discovery (UDP)   ┌──────────────────┐
//!  │   StreamOutlet   │ <────────────────── │     Resolver     │
//!  │                  │   data feed (TCP)   │                  │
//!  │  SendBuffer ─────┼───────────────────> │   StreamInlet    │
//!  │                  │   time probes (UDP) │                  │
//!  │                  │ <─────────────────> │                  │
//!  └──────────────────┘                     └──────────────────┘
//! ```
//!
//! - **`application`** – [`StreamOutlet`], [`StreamInlet`], [`Resolver`]
//!   and [`ContinuousResolver`].  All calls are blocking and take explicit
//!   timeouts; the network work runs on a small private Tokio runtime per
//!   object.
//! - **`infrastructure`** – configuration, logging, sockets and the
//!   per-channel protocol tasks.
//! - **`error`** – [`StreamError`] and the per-thread [`last_error`].
//!
//! The socket-free building blocks (descriptors, queries, the wire codec,
//! buffers, clock sync) live in `labstream_core` and are re-exported here
//! where callers need them.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use labstream::{resolve_stream, ChannelFormat, InletOptions, OutletOptions,
//!                 StreamInfo, StreamInlet, StreamOutlet};
//!
//! # fn main() -> labstream::Result<()> {
//! let info = StreamInfo::new("EEG", "eeg", 8, 250.0, ChannelFormat::Float32, "amp-1")?;
//! let outlet = StreamOutlet::new(info, OutletOptions::default())?;
//! outlet.push_sample(&[0.0f32; 8])?;
//!
//! let found = resolve_stream("name", "EEG", 1, Duration::from_secs(5))?;
//! let inlet = StreamInlet::new(found[0].clone(), InletOptions::default())?;
//! let sample = inlet.pull_sample::<f32>(Duration::from_secs(1))?;
//! # let _ = sample;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod error;
pub mod infrastructure;

pub use application::buffering::BufferSize;
pub use application::inlet::{InletOptions, StreamInlet};
pub use application::outlet::{OutletOptions, StreamOutlet};
pub use application::resolver::{
    property_query, resolve_bypred, resolve_stream, resolve_streams, session_query,
    ContinuousResolver, Resolver, FOREVER,
};
pub use error::{clear_last_error, last_error, Result, StreamError};
pub use infrastructure::config::ApiConfig;
pub use infrastructure::logging::init_logging;

pub use labstream_core::protocol::messages::TransportMode;
pub use labstream_core::{
    local_clock, ChannelFormat, ChannelValues, ClockEstimate, DescElement, Description,
    ProcessingFlags, Query, SampleValue, StreamInfo, IRREGULAR_RATE,
};
