//! The closed set of per-channel value formats a stream can carry.
//!
//! # Why a closed enum? (for beginners)
//!
//! Every sample of a stream stores `channel_count` values of one single
//! format.  Numeric formats have a fixed element width (an `int16` is always
//! two bytes on the wire), while `string` channels are variable-length and
//! travel with a length prefix.  Modelling the formats as a `#[repr(u8)]`
//! enum gives us:
//!
//! - a stable one-byte wire code (the discriminant),
//! - exhaustive `match` statements wherever the format changes behaviour
//!   (encoding, decoding, conversion), so adding a format is a compile error
//!   everywhere it is not yet handled.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value format shared by all channels of a stream.
///
/// The discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ChannelFormat {
    /// Format not (yet) known.  Streams cannot be published with it.
    Undefined = 0,
    Float32 = 1,
    Double64 = 2,
    /// UTF-8 text, variable length per value.
    String = 3,
    Int32 = 4,
    Int16 = 5,
    Int8 = 6,
    Int64 = 7,
}

impl ChannelFormat {
    /// Every format that can carry data, in wire-code order.
    pub const ALL: [ChannelFormat; 7] = [
        ChannelFormat::Float32,
        ChannelFormat::Double64,
        ChannelFormat::String,
        ChannelFormat::Int32,
        ChannelFormat::Int16,
        ChannelFormat::Int8,
        ChannelFormat::Int64,
    ];

    /// Fixed on-wire width of one value in bytes.
    ///
    /// `None` for [`ChannelFormat::String`] (variable length) and for
    /// [`ChannelFormat::Undefined`].
    pub fn element_width(self) -> Option<usize> {
        match self {
            ChannelFormat::Int8 => Some(1),
            ChannelFormat::Int16 => Some(2),
            ChannelFormat::Int32 | ChannelFormat::Float32 => Some(4),
            ChannelFormat::Int64 | ChannelFormat::Double64 => Some(8),
            ChannelFormat::String | ChannelFormat::Undefined => None,
        }
    }

    /// Returns `true` for the integer formats.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ChannelFormat::Int8 | ChannelFormat::Int16 | ChannelFormat::Int32 | ChannelFormat::Int64
        )
    }

    /// Returns `true` for every format except string and undefined.
    pub fn is_numeric(self) -> bool {
        self.element_width().is_some()
    }

    /// The lowercase name used in serialized descriptors and queries.
    pub fn name(self) -> &'static str {
        match self {
            ChannelFormat::Undefined => "undefined",
            ChannelFormat::Float32 => "float32",
            ChannelFormat::Double64 => "double64",
            ChannelFormat::String => "string",
            ChannelFormat::Int32 => "int32",
            ChannelFormat::Int16 => "int16",
            ChannelFormat::Int8 => "int8",
            ChannelFormat::Int64 => "int64",
        }
    }

    /// Parses a format name as produced by [`ChannelFormat::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "undefined" => Some(ChannelFormat::Undefined),
            "float32" => Some(ChannelFormat::Float32),
            "double64" => Some(ChannelFormat::Double64),
            "string" => Some(ChannelFormat::String),
            "int32" => Some(ChannelFormat::Int32),
            "int16" => Some(ChannelFormat::Int16),
            "int8" => Some(ChannelFormat::Int8),
            "int64" => Some(ChannelFormat::Int64),
            _ => None,
        }
    }
}

impl TryFrom<u8> for ChannelFormat {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelFormat::Undefined),
            1 => Ok(ChannelFormat::Float32),
            2 => Ok(ChannelFormat::Double64),
            3 => Ok(ChannelFormat::String),
            4 => Ok(ChannelFormat::Int32),
            5 => Ok(ChannelFormat::Int16),
            6 => Ok(ChannelFormat::Int8),
            7 => Ok(ChannelFormat::Int64),
            other => Err(other),
        }
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
