//! # labstream-core
//!
//! Socket-free foundation of labstream: stream descriptors, the discovery
//! query language, the binary wire codec, sample buffers, clock
//! synchronization and cooperative cancellation.
//!
//! The `labstream` crate builds the network layer and the public
//! outlet/inlet/resolver API on top of this crate.
//!
//! # Architecture overview (for beginners)
//!
//! labstream moves time-stamped multi-channel samples (EEG, motion capture,
//! markers, ...) between programs on a lab network without a central
//! broker.  A producer publishes an *outlet*; consumers find it by query and
//! open an *inlet* on it.
//!
//! - **`domain`** – the stream descriptor ([`StreamInfo`]), its free-form
//!   description tree, channel formats and typed values, and the resolver's
//!   result cache.
//!
//! - **`query`** – the small predicate language used to find streams, e.g.
//!   `name='EEG' and type!='Markers'`.
//!
//! - **`protocol`** – how bytes travel over the network: a 24-byte header
//!   plus a payload, for discovery datagrams and data connections alike.
//!
//! - **`buffer`** – bounded drop-oldest queues fanning samples out from one
//!   producer to many consumers.
//!
//! - **`cancellation`** – registries that wake blocked calls when the object
//!   they wait on goes away.
//!
//! - **`time`** – the local clock, round-trip clock offset estimation, and
//!   timestamp post-processing.

pub mod buffer;
pub mod cancellation;
pub mod domain;
pub mod protocol;
pub mod query;
pub mod time;

// Re-export the most-used types at the crate root so callers can write
// `labstream_core::StreamInfo` instead of the full module path.
pub use buffer::{Consumer, ConsumerQueue, PopResult, SendBuffer};
pub use cancellation::{Cancellable, CancellableOperation, CancellationRegistry, RegistryRef};
pub use domain::channel_format::ChannelFormat;
pub use domain::description::{DescElement, Description};
pub use domain::result_cache::ResultCache;
pub use domain::sample::Sample;
pub use domain::stream_info::{DescriptorError, StreamInfo, IRREGULAR_RATE, STREAM_PROTOCOL_VERSION};
pub use domain::values::{ChannelValues, SampleValue, ValueError};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::WireMessage;
pub use query::{Query, QueryParseError};
pub use time::{local_clock, ClockEstimate, ProcessingFlags};
