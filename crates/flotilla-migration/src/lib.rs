//! flotilla-migration — host-to-host moves for stateful services.
//!
//! Stateful services are never auto-rescheduled; moving one is an explicit
//! operator action that stops the container, snapshots its volumes,
//! restores them on the target, and restarts via a normal rollout.

pub mod controller;
pub mod error;

pub use controller::{MigrationController, MigrationOutcome};
pub use error::{MigrationError, MigrationResult};
