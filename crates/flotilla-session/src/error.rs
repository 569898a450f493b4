//! Error types for the session layer.

use thiserror::Error;

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while managing agent sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("host {0} has no active session")]
    NotConnected(String),

    #[error("replayed sequence {got} (last accepted {last})")]
    ReplayedSequence { got: u64, last: u64 },

    #[error("session {0} was superseded")]
    Superseded(String),
}
