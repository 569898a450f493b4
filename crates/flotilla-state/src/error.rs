//! Error types for the desired-state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("domain {domain} is already claimed by service {service_id}")]
    DomainTaken { domain: String, service_id: String },

    #[error("external port {port} is already claimed by service {service_id}")]
    ExternalPortTaken { port: u16, service_id: String },

    #[error("a rollout is already in progress for service {0}")]
    RolloutInProgress(String),

    #[error("a migration is in progress for service {0}")]
    MigrationInProgress(String),

    #[error("a work item is already processing for host {0}")]
    HostBusy(String),
}
