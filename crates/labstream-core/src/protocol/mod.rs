//! Protocol module containing message types, the binary codec, and the
//! sample batch encoding.

pub mod codec;
pub mod messages;
pub mod sample_codec;
pub mod sequence;

pub use codec::{
    decode_frame, decode_header, decode_message, decode_payload, encode_message,
    MessageHeader, ProtocolError,
};
pub use messages::*;
pub use sequence::SequenceCounter;
