//! flotilla-rollout — the staged deployment state machine.
//!
//! One rollout at a time per service converges actual state to desired
//! state: create the new generation, gate on container health, propagate
//! DNS then routing config to the fleet, drain the old generation, then
//! promote. Every failed stage funnels into the rollback path; an
//! operator can abort outright.

pub mod controller;
pub mod error;

pub use controller::{DEFAULT_ROLLOUT_TIMEOUT, RolloutController};
pub use error::{RolloutError, RolloutResult};
