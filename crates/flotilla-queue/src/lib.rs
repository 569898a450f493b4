//! flotilla-queue — durable per-host work queues.
//!
//! Work items are the only state that must survive a control-plane
//! restart; they live in the state store. This crate layers the queue
//! semantics on top: FIFO per host, at most one item in flight per host,
//! bounded retries, and the typed payload boundary.
//!
//! # Components
//!
//! - **`payload`** — the tagged `WorkPayload` sum type (opaque bytes at the queue layer)
//! - **`queue`** — enqueue / claim / complete / reclaim

pub mod error;
pub mod payload;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use payload::{PayloadPort, PayloadVolume, WireguardPeer, WorkPayload};
pub use queue::{DEFAULT_MAX_ATTEMPTS, DEFAULT_WORK_TIMEOUT, WorkQueue};
