//! Error types for the migration controller.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors raised while starting or driving a migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    State(#[from] flotilla_state::StateError),

    #[error(transparent)]
    Queue(#[from] flotilla_queue::QueueError),

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("service {0} is not stateful")]
    NotStateful(String),

    #[error("service {0} has no volumes to migrate")]
    NoVolumes(String),

    #[error("service {0} has no running deployment to migrate")]
    NoRunningDeployment(String),

    #[error("service {0} is already migrating")]
    AlreadyMigrating(String),

    #[error("a rollout is in progress for service {0}")]
    RolloutInProgress(String),

    #[error("service {0} already runs on the target host")]
    SameHost(String),

    #[error("backup storage is not configured")]
    BackupStorageNotConfigured,
}
