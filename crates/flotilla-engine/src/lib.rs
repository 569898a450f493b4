//! flotilla-engine — the orchestration core.
//!
//! Owns the trigger API the external HTTP layer calls into, the agent
//! event loop, the work dispatcher, and stale-host recovery, composing the
//! per-subsystem crates:
//!
//! ```text
//! triggers (deploy / abort / migrate / cancel / restart / remove)
//!   └── Engine ── per-service keyed locks
//!         ├── RolloutController   (flotilla-rollout)
//!         ├── MigrationController (flotilla-migration)
//!         ├── WorkQueue           (flotilla-queue)
//!         ├── Fanout              (flotilla-fanout)
//!         └── spread placement    (flotilla-placement)
//!
//! background loops
//!   ├── event loop   — consumes AgentEvents from the session layer
//!   ├── dispatcher   — 1s tick: reclaim stuck work, sweep stuck
//!   │                  rollouts, push one item per idle host
//!   └── stale sweep  — 30s tick: offline detection + recovery
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod locks;

pub use config::EngineConfig;
pub use engine::{DeployOutcome, Engine};
pub use error::{EngineError, EngineResult};
pub use gate::{BuildGate, NoBuilds};
pub use locks::ServiceLocks;
