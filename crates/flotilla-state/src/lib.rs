//! flotilla-state — embedded desired-state store for the control plane.
//!
//! Backed by [redb](https://docs.rs/redb), this crate is the DSDB gateway:
//! typed access to every persisted entity plus the compound, transactional
//! operations the controllers depend on.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Child rows use composite keys (`{service_id}:{suffix}`) so prefix scans
//! return an owned set; work items are keyed `{host_id}:{seq:020}` so redb
//! key order is the per-host FIFO order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. The one contract it exposes: every
//! mutation that changes more than one row is atomic.

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use snapshot::desired_config;
pub use store::{AbortedRollout, CompletedRollout, StateStore};
pub use types::*;
