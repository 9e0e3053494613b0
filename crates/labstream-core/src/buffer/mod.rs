//! Sample buffering between producers, sessions and consumers.

pub mod consumer_queue;
pub mod send_buffer;

pub use consumer_queue::{ConsumerQueue, PopResult};
pub use send_buffer::{Consumer, SendBuffer};
