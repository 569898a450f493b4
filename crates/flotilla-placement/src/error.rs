//! Error types for placement decisions.

use thiserror::Error;

/// Result type alias for placement operations.
pub type PlacementResult<T> = Result<T, PlacementError>;

/// Errors that can occur while computing placements.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no eligible hosts for placement")]
    NoEligibleHosts,
}
