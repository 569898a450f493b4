//! Error types for engine triggers.

use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned to API triggers and raised by the background loops.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] flotilla_state::StateError),

    #[error(transparent)]
    Queue(#[from] flotilla_queue::QueueError),

    #[error(transparent)]
    Rollout(#[from] flotilla_rollout::RolloutError),

    #[error(transparent)]
    Migration(#[from] flotilla_migration::MigrationError),

    #[error(transparent)]
    Fanout(#[from] flotilla_fanout::FanoutError),

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("deployment in progress")]
    DeploymentInProgress,

    #[error("a migration is in progress for service {0}")]
    MigrationInProgress(String),

    #[error("stateful service {0} must place exactly one replica on exactly one host")]
    InvalidStatefulPlacement(String),

    #[error("no healthy hosts available for placement")]
    NoHealthyHosts,
}
