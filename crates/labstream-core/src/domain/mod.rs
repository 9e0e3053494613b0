//! Pure stream data types with no I/O.
//!
//! - [`stream_info`]: the stream descriptor and its serialization.
//! - [`description`]: the free-form metadata tree inside a descriptor.
//! - [`channel_format`] / [`values`]: per-channel value formats and
//!   conversion between them.
//! - [`sample`]: one time-stamped frame.
//! - [`result_cache`]: discovery results keyed by uid with age-out.

pub mod channel_format;
pub mod description;
pub mod result_cache;
pub mod sample;
pub mod stream_info;
pub mod values;
