//! A single time-stamped sample travelling from an outlet to its inlets.

use crate::domain::values::ChannelValues;

/// One frame: a timestamp plus one value per channel.
///
/// `sequence` is assigned by the outlet's send buffer in push order and is
/// carried on the wire so inlets can detect frames dropped by the
/// drop-oldest policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Capture time on the producer's local clock, in seconds.
    pub timestamp: f64,
    pub values: ChannelValues,
    /// Request immediate transmission instead of batching.
    pub pushthrough: bool,
    pub sequence: u64,
}

impl Sample {
    /// Creates a sample; the sequence number is filled in on push.
    pub fn new(timestamp: f64, values: ChannelValues, pushthrough: bool) -> Self {
        Self {
            timestamp,
            values,
            pushthrough,
            sequence: 0,
        }
    }
}
