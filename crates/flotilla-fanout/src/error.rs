//! Error types for config fan-out.

use thiserror::Error;

/// Result type alias for fan-out operations.
pub type FanoutResult<T> = Result<T, FanoutError>;

/// Errors that can occur while deriving or pushing config tables.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    State(#[from] flotilla_state::StateError),
}
