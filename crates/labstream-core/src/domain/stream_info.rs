//! The stream descriptor: everything a consumer needs to know about a stream.
//!
//! # Sharing and copy-on-write (for beginners)
//!
//! Descriptors are passed around constantly: the outlet keeps one, every
//! discovery reply carries one, every inlet holds one.  Copying the
//! description tree each time would be wasteful, so [`StreamInfo`] stores the
//! tree behind an [`Arc`] (a reference-counted pointer).  `Clone` only bumps
//! the reference count.
//!
//! Mutation goes through [`StreamInfo::desc_mut`], which calls
//! [`Arc::make_mut`]: if another copy still shares the tree, the tree is
//! cloned first and only this copy sees the change.  Readers of a shared
//! tree therefore never observe a half-mutated tree and never block.
//! [`StreamInfo::deep_clone`] forces an independent copy up front.
//!
//! # Serialization levels
//!
//! - *short info*: every field except the description tree.  This is what
//!   discovery replies carry.
//! - *full info*: short info plus the description tree, fetched on demand
//!   over a data connection.
//!
//! Both are JSON documents `{"info": {...}, "desc": [...]}` produced with
//! `serde_json`, which rejects truncated or adversarial input with an error
//! instead of panicking.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::channel_format::ChannelFormat;
use crate::domain::description::Description;
use crate::query::Query;
use crate::time::clock::local_clock;

/// Nominal rate of streams whose samples arrive at irregular intervals.
pub const IRREGULAR_RATE: f64 = 0.0;

/// Version of the stream protocol spoken by this implementation
/// (major × 100 + minor).
pub const STREAM_PROTOCOL_VERSION: u32 = 110;

/// Errors raised when a descriptor is invalid.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DescriptorError {
    /// Streams must have a name.
    #[error("stream name must not be empty")]
    EmptyName,

    /// The channel count was negative.
    #[error("channel count must not be negative, got {0}")]
    NegativeChannelCount(i64),

    /// The nominal rate was negative or not a number.
    #[error("nominal sampling rate must be a non-negative number, got {0}")]
    InvalidRate(f64),

    /// A parsed descriptor had no uid.
    #[error("stream uid must not be empty")]
    EmptyUid,

    /// A parsed descriptor carried an impossible protocol version.
    #[error("invalid stream protocol version {0}")]
    InvalidVersion(u32),

    /// The channel format cannot carry data.
    #[error("channel format {0} cannot be published")]
    UnpublishableFormat(ChannelFormat),

    /// The serialized text could not be parsed.
    #[error("malformed stream info: {0}")]
    Malformed(String),
}

/// Scalar fields of a descriptor, serialized as the `info` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InfoFields {
    name: String,
    #[serde(rename = "type", default)]
    content_type: String,
    channel_count: u32,
    nominal_srate: f64,
    channel_format: ChannelFormat,
    #[serde(default)]
    source_id: String,
    version: u32,
    #[serde(default)]
    created_at: f64,
    uid: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    v4address: String,
    #[serde(default)]
    v4data_port: u16,
    #[serde(default)]
    v4service_port: u16,
    #[serde(default)]
    v6address: String,
    #[serde(default)]
    v6data_port: u16,
    #[serde(default)]
    v6service_port: u16,
}

#[derive(Serialize)]
struct InfoDocument<'a> {
    info: &'a InfoFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    desc: Option<&'a Description>,
}

#[derive(Deserialize)]
struct OwnedInfoDocument {
    info: InfoFields,
    #[serde(default)]
    desc: Description,
}

/// Metadata describing one stream.
///
/// `Clone` is cheap and shares the description tree; see the module docs.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    fields: InfoFields,
    desc: Arc<Description>,
}

impl StreamInfo {
    /// Creates a descriptor with a fresh uid, the local hostname and the
    /// current local-clock time as creation stamp.
    ///
    /// `channel_count` is signed so that callers passing through untrusted
    /// integers get a [`DescriptorError`] instead of a silent wrap.
    ///
    /// # Errors
    ///
    /// [`DescriptorError::EmptyName`], [`DescriptorError::NegativeChannelCount`]
    /// or [`DescriptorError::InvalidRate`].
    pub fn new(
        name: &str,
        content_type: &str,
        channel_count: i32,
        nominal_srate: f64,
        channel_format: ChannelFormat,
        source_id: &str,
    ) -> Result<Self, DescriptorError> {
        if name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        let channel_count = u32::try_from(channel_count)
            .map_err(|_| DescriptorError::NegativeChannelCount(i64::from(channel_count)))?;
        if nominal_srate.is_nan() || nominal_srate < 0.0 {
            return Err(DescriptorError::InvalidRate(nominal_srate));
        }

        Ok(Self {
            fields: InfoFields {
                name: name.to_string(),
                content_type: content_type.to_string(),
                channel_count,
                nominal_srate,
                channel_format,
                source_id: source_id.to_string(),
                version: STREAM_PROTOCOL_VERSION,
                created_at: local_clock(),
                uid: Uuid::new_v4().to_string(),
                session_id: "default".to_string(),
                hostname: local_hostname().to_string(),
                v4address: String::new(),
                v4data_port: 0,
                v4service_port: 0,
                v6address: String::new(),
                v6data_port: 0,
                v6service_port: 0,
            },
            desc: Arc::new(Description::new()),
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.fields.name
    }

    /// Content type, e.g. `"EEG"` or `"Markers"`.
    pub fn content_type(&self) -> &str {
        &self.fields.content_type
    }

    pub fn channel_count(&self) -> usize {
        self.fields.channel_count as usize
    }

    /// Samples per second, or [`IRREGULAR_RATE`].
    pub fn nominal_srate(&self) -> f64 {
        self.fields.nominal_srate
    }

    pub fn channel_format(&self) -> ChannelFormat {
        self.fields.channel_format
    }

    pub fn source_id(&self) -> &str {
        &self.fields.source_id
    }

    pub fn version(&self) -> u32 {
        self.fields.version
    }

    /// Local-clock time at which the descriptor was created.
    pub fn created_at(&self) -> f64 {
        self.fields.created_at
    }

    pub fn uid(&self) -> &str {
        &self.fields.uid
    }

    pub fn session_id(&self) -> &str {
        &self.fields.session_id
    }

    pub fn hostname(&self) -> &str {
        &self.fields.hostname
    }

    pub fn v4address(&self) -> &str {
        &self.fields.v4address
    }

    pub fn v4data_port(&self) -> u16 {
        self.fields.v4data_port
    }

    pub fn v4service_port(&self) -> u16 {
        self.fields.v4service_port
    }

    pub fn v6address(&self) -> &str {
        &self.fields.v6address
    }

    pub fn v6data_port(&self) -> u16 {
        self.fields.v6data_port
    }

    pub fn v6service_port(&self) -> u16 {
        self.fields.v6service_port
    }

    /// Read-only view of the description tree.
    pub fn desc(&self) -> &Description {
        &self.desc
    }

    /// Mutable view of the description tree.
    ///
    /// Clones the tree first if another copy of this descriptor shares it.
    pub fn desc_mut(&mut self) -> &mut Description {
        Arc::make_mut(&mut self.desc)
    }

    /// Returns a copy that shares nothing with `self`.
    pub fn deep_clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            desc: Arc::new(Description::clone(&self.desc)),
        }
    }

    /// `true` when both copies currently share one description tree.
    pub fn shares_desc_with(&self, other: &StreamInfo) -> bool {
        Arc::ptr_eq(&self.desc, &other.desc)
    }

    /// `true` if this descriptor satisfies `query`.
    pub fn matches_query(&self, query: &Query) -> bool {
        query.matches(self)
    }

    /// Bytes needed to hold one sample's values, or `None` for text and
    /// undefined formats.
    pub fn sample_bytes(&self) -> Option<usize> {
        self.fields
            .channel_format
            .element_width()
            .map(|w| w * self.channel_count())
    }

    // ── Fields filled in by outlets and resolvers ─────────────────────────────

    pub fn set_session_id(&mut self, session_id: &str) {
        self.fields.session_id = session_id.to_string();
    }

    pub fn set_v4address(&mut self, address: &str) {
        self.fields.v4address = address.to_string();
    }

    pub fn set_v6address(&mut self, address: &str) {
        self.fields.v6address = address.to_string();
    }

    /// Records the ports an outlet serves this stream on.
    pub fn set_v4ports(&mut self, data_port: u16, service_port: u16) {
        self.fields.v4data_port = data_port;
        self.fields.v4service_port = service_port;
    }

    pub fn set_v6ports(&mut self, data_port: u16, service_port: u16) {
        self.fields.v6data_port = data_port;
        self.fields.v6service_port = service_port;
    }

    /// Checks that the stream can be published by an outlet.
    ///
    /// # Errors
    ///
    /// [`DescriptorError::UnpublishableFormat`] for the undefined format.
    pub fn validate_for_publishing(&self) -> Result<(), DescriptorError> {
        if self.fields.name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if self.fields.channel_format == ChannelFormat::Undefined {
            return Err(DescriptorError::UnpublishableFormat(
                self.fields.channel_format,
            ));
        }
        Ok(())
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    /// Serializes every field except the description tree.
    ///
    /// # Errors
    ///
    /// [`DescriptorError::Malformed`] if `serde_json` rejects a value.
    pub fn to_shortinfo_message(&self) -> Result<String, DescriptorError> {
        self.to_document(None)
    }

    /// Serializes every field including the description tree.
    ///
    /// # Errors
    ///
    /// [`DescriptorError::Malformed`] if `serde_json` rejects a value.
    pub fn to_fullinfo_message(&self) -> Result<String, DescriptorError> {
        self.to_document(Some(&self.desc))
    }

    fn to_document(&self, desc: Option<&Description>) -> Result<String, DescriptorError> {
        serde_json::to_string(&InfoDocument {
            info: &self.fields,
            desc,
        })
        .map_err(|e| DescriptorError::Malformed(e.to_string()))
    }

    /// Parses a short or full info message.
    ///
    /// # Errors
    ///
    /// [`DescriptorError::Malformed`] for unparseable text and the
    /// validation errors for parseable but invalid descriptors.
    pub fn from_message(text: &str) -> Result<Self, DescriptorError> {
        let doc: OwnedInfoDocument =
            serde_json::from_str(text).map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        let fields = doc.info;

        if fields.name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if fields.uid.is_empty() {
            return Err(DescriptorError::EmptyUid);
        }
        if fields.version == 0 {
            return Err(DescriptorError::InvalidVersion(fields.version));
        }
        if fields.nominal_srate.is_nan() || fields.nominal_srate < 0.0 {
            return Err(DescriptorError::InvalidRate(fields.nominal_srate));
        }

        Ok(Self {
            fields,
            desc: Arc::new(doc.desc),
        })
    }
}

impl PartialEq for StreamInfo {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && *self.desc == *other.desc
    }
}

/// Hostname of this machine, read once.
fn local_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        let name = gethostname::gethostname().to_string_lossy().trim().to_string();
        if name.is_empty() {
            "localhost".to_string()
        } else {
            name
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
