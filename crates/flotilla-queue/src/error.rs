//! Error types for the work queue.

use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    State(#[from] flotilla_state::StateError),

    #[error("payload encoding error: {0}")]
    Payload(String),
}
