//! The error type returned by every public labstream call.
//!
//! Four classes matter to callers:
//!
//! | Variant           | Raised when                                         |
//! |-------------------|-----------------------------------------------------|
//! | `Configuration`   | a descriptor or option is invalid, before any I/O   |
//! | `QueryParse`      | a discovery predicate is malformed, before any I/O  |
//! | `ConnectionLost`  | the peer went away on the data or control path      |
//! | `TimeoutExpired`  | a bounded wait ran out with no failure detected     |
//!
//! The remaining variants wrap lower-level errors and are mostly seen when
//! pushing values that do not fit a stream.
//!
//! # Last error per thread
//!
//! Construction-time failures are also recorded in thread-local storage so
//! that a thread can ask "what went wrong last" without another thread's
//! failure overwriting the answer.  See [`last_error`].

use std::cell::RefCell;

use labstream_core::{DescriptorError, ProtocolError, QueryParseError, ValueError};
use thiserror::Error;

use crate::infrastructure::config::ConfigError;

/// Errors raised by outlets, inlets and resolvers.
#[derive(Debug, Error)]
pub enum StreamError {
    /// An invalid descriptor or option was supplied at construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A discovery predicate could not be parsed.
    #[error("invalid query: {0}")]
    QueryParse(#[from] QueryParseError),

    /// The peer is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A bounded wait expired.
    #[error("{operation} timed out")]
    TimeoutExpired { operation: &'static str },

    /// Pushed or pulled values do not fit the stream.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// The peer sent bytes that do not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be loaded.
    #[error("configuration file error: {0}")]
    Config(#[from] ConfigError),
}

impl From<DescriptorError> for StreamError {
    fn from(e: DescriptorError) -> Self {
        StreamError::Configuration(e.to_string())
    }
}

/// Shorthand for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Message of the most recent construction-time failure on this thread.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Forgets the calling thread's last error.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

/// Stores `error`'s message as this thread's last error and hands it back,
/// for use in `map_err`.
pub(crate) fn record<E: Into<StreamError>>(error: E) -> StreamError {
    let error = error.into();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error.to_string()));
    error
}

// ── Tests ─────────────────────────────────────────────────────────────────────
