//! Ed25519 envelope authentication.
//!
//! The signature domain is `ascii(timestamp) || ":" || payload_bytes`. The
//! same domain covers stream envelopes (`timestamp_ms` + serialized
//! `AgentPayload`) and the HTTP endpoints (`X-Timestamp` header + body), so
//! agents carry one signing routine.

use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{WireError, WireResult};

/// Maximum configurable clock-skew bound.
pub const MAX_SKEW: Duration = Duration::from_secs(300);

/// Default clock-skew bound.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(60);

/// Build the byte string the signature covers.
pub fn signing_bytes(timestamp_ms: i64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = timestamp_ms.to_string().into_bytes();
    bytes.push(b':');
    bytes.extend_from_slice(payload);
    bytes
}

/// Sign a payload (agent side; used here by tests and tooling).
pub fn sign(key: &SigningKey, timestamp_ms: i64, payload: &[u8]) -> Vec<u8> {
    key.sign(&signing_bytes(timestamp_ms, payload))
        .to_bytes()
        .to_vec()
}

/// Verify an envelope signature against a host's stored hex-encoded key.
pub fn verify(
    public_key_hex: &str,
    timestamp_ms: i64,
    payload: &[u8],
    signature: &[u8],
) -> WireResult<()> {
    let key = parse_public_key(public_key_hex)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| WireError::MalformedSignature(e.to_string()))?;
    key.verify(&signing_bytes(timestamp_ms, payload), &signature)
        .map_err(|_| WireError::BadSignature)
}

/// Enforce the clock-skew bound on an envelope timestamp. `bound` is
/// clamped to [`MAX_SKEW`].
pub fn check_skew(now_ms: i64, sent_ms: i64, bound: Duration) -> WireResult<()> {
    let bound_ms = bound.min(MAX_SKEW).as_millis() as i64;
    if (now_ms - sent_ms).abs() > bound_ms {
        return Err(WireError::ClockSkew {
            sent_ms,
            now_ms,
            bound_ms,
        });
    }
    Ok(())
}

/// Verify an HTTP request signed over `X-Timestamp || ":" || body`.
///
/// Used by the external HTTP layer for build agents and status reporters;
/// only the verification primitive lives in the core.
pub fn verify_http(
    public_key_hex: &str,
    timestamp_header: &str,
    body: &[u8],
    signature: &[u8],
    now_ms: i64,
    bound: Duration,
) -> WireResult<()> {
    let sent_ms: i64 = timestamp_header
        .parse()
        .map_err(|_| WireError::MalformedTimestamp(timestamp_header.to_string()))?;
    check_skew(now_ms, sent_ms, bound)?;
    verify(public_key_hex, sent_ms, body, signature)
}

/// Hex-encode a verifying key the way host rows store it.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    hex::encode(key.to_bytes())
}

fn parse_public_key(public_key_hex: &str) -> WireResult<VerifyingKey> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| WireError::MalformedKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| WireError::MalformedKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| WireError::MalformedKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = test_key();
        let pk = encode_public_key(&key.verifying_key());
        let payload = b"status update bytes";

        let sig = sign(&key, 1_700_000_000_000, payload);
        verify(&pk, 1_700_000_000_000, payload, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = test_key();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let pk = encode_public_key(&other.verifying_key());

        let sig = sign(&key, 1_000, b"payload");
        assert!(matches!(
            verify(&pk, 1_000, b"payload", &sig),
            Err(WireError::BadSignature)
        ));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let key = test_key();
        let pk = encode_public_key(&key.verifying_key());

        let sig = sign(&key, 1_000, b"payload");
        assert!(verify(&pk, 1_000, b"payload2", &sig).is_err());
    }

    #[test]
    fn verify_rejects_shifted_timestamp() {
        let key = test_key();
        let pk = encode_public_key(&key.verifying_key());

        // The timestamp is part of the signature domain.
        let sig = sign(&key, 1_000, b"payload");
        assert!(verify(&pk, 1_001, b"payload", &sig).is_err());
    }

    #[test]
    fn skew_bound_is_symmetric() {
        let bound = Duration::from_secs(60);
        check_skew(100_000, 100_000, bound).unwrap();
        check_skew(100_000, 100_000 - 59_999, bound).unwrap();
        check_skew(100_000, 100_000 + 59_999, bound).unwrap();
        assert!(check_skew(100_000, 100_000 - 60_001, bound).is_err());
        assert!(check_skew(100_000, 100_000 + 60_001, bound).is_err());
    }

    #[test]
    fn skew_bound_clamps_to_max() {
        // A mis-configured 1h bound still rejects at the 5min cap.
        let bound = Duration::from_secs(3_600);
        assert!(check_skew(10_000_000, 0, bound).is_err());
    }

    #[test]
    fn http_signature_matches_stream_domain() {
        let key = test_key();
        let pk = encode_public_key(&key.verifying_key());
        let body = br#"{"build":"ok"}"#;

        let sig = sign(&key, 5_000, body);
        verify_http(&pk, "5000", body, &sig, 5_500, Duration::from_secs(60)).unwrap();
        assert!(verify_http(&pk, "bogus", body, &sig, 5_500, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!(matches!(
            verify("zz", 0, b"", &[0u8; 64]),
            Err(WireError::MalformedKey(_))
        ));
        assert!(matches!(
            verify("abcd", 0, b"", &[0u8; 64]),
            Err(WireError::MalformedKey(_))
        ));
    }
}
