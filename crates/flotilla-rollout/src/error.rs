//! Error types for the rollout controller.

use thiserror::Error;

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors raised while driving a rollout.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    State(#[from] flotilla_state::StateError),

    #[error(transparent)]
    Queue(#[from] flotilla_queue::QueueError),

    #[error(transparent)]
    Fanout(#[from] flotilla_fanout::FanoutError),

    #[error("service {0} not found")]
    ServiceNotFound(String),
}
