//! Application layer: the objects a program holds on to.
//!
//! # What lives here? (for beginners)
//!
//! Everything below this layer is plumbing: sockets, wire messages,
//! runtimes.  The types here turn that plumbing into three blocking,
//! thread-safe handles:
//!
//! - **`outlet`**    – [`outlet::StreamOutlet`] publishes one stream, answers
//!   discovery queries and serves any number of inlets.
//!
//! - **`inlet`**     – [`inlet::StreamInlet`] receives one stream, keeps it
//!   buffered locally and maps its timestamps onto the local clock.
//!
//! - **`resolver`**  – one-shot and continuous discovery of streams matching
//!   a query.
//!
//! - **`buffering`** – how "six minutes of data" becomes a sample count.
//!
//! Every blocking call takes an explicit timeout and returns early with an
//! error when the object it waits on goes away.

pub mod buffering;
pub mod inlet;
pub mod outlet;
pub mod resolver;
