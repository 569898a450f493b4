//! flotilla-wire — the agent stream protocol.
//!
//! Protobuf message definitions plus the Ed25519 envelope authentication
//! shared by the stream gateway and the external HTTP endpoints.

pub mod envelope;
pub mod error;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("flotilla.agent.v1");
}

pub use envelope::{DEFAULT_SKEW, MAX_SKEW, check_skew, sign, signing_bytes, verify, verify_http};
pub use error::{WireError, WireResult};

use prost::Message;

/// Serialize an [`proto::AgentPayload`] into envelope payload bytes.
pub fn encode_payload(payload: &proto::AgentPayload) -> Vec<u8> {
    payload.encode_to_vec()
}

/// Decode envelope payload bytes back into an [`proto::AgentPayload`].
pub fn decode_payload(bytes: &[u8]) -> Result<proto::AgentPayload, prost::DecodeError> {
    proto::AgentPayload::decode(bytes)
}
