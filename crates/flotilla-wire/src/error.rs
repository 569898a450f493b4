//! Error types for envelope authentication.

use thiserror::Error;

/// Result type alias for wire-level operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors produced while authenticating an agent envelope.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("timestamp outside allowed skew: sent {sent_ms}, now {now_ms}, bound {bound_ms}ms")]
    ClockSkew {
        sent_ms: i64,
        now_ms: i64,
        bound_ms: i64,
    },

    #[error("malformed timestamp header: {0}")]
    MalformedTimestamp(String),
}
