//! flotilla-session — the agent session layer.
//!
//! One authenticated bidirectional stream per host. The session table is
//! strictly in-memory; it never survives a restart and never outlives the
//! stream it fronts.
//!
//! # Architecture
//!
//! ```text
//! Agent
//!   └── Session stream (gRPC, Ed25519-signed envelopes)
//!         ├── AgentGatewayService: authenticates the first frame,
//!         │   installs the session (evicting any duplicate)
//!         └── SessionReader: one task per agent; validates skew,
//!             signature, and sequence on every envelope, refreshes
//!             liveness, emits AgentEvents to the engine
//!
//! Engine / fan-out
//!   └── SessionManager.send / broadcast — stamped, best-effort frames
//! ```

pub mod error;
pub mod events;
pub mod manager;
pub mod server;
pub mod tls;

pub use error::{SessionError, SessionResult};
pub use events::{AgentEvent, ConfigKind, ContainerReport};
pub use manager::{SendOutcome, SessionInfo, SessionManager};
pub use server::AgentGatewayService;
