//! Cooperative cancellation of blocking calls.

pub mod registry;
pub mod signal;

pub use registry::{Cancellable, CancellableOperation, CancellationRegistry, RegistryRef};
pub use signal::{WaitOutcome, WaitSlot};
