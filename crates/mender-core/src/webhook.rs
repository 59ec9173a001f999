//! Webhook ingestion (§6) — verifies the code host's HMAC signature and
//! parses the minimal event shape the orchestrator needs to enqueue a
//! pipeline run.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("signature header missing or malformed")]
    MissingSignature,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("payload was not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),
}

/// Minimal shape extracted from a `workflow_run` (or equivalent) webhook
/// payload — everything else in the payload is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestEvent {
    pub repo: String,
    pub run_id: u64,
    pub sha: String,
    pub branch: String,
    pub workflow_name: String,
    pub action: String,
    pub conclusion: String,
}

impl IngestEvent {
    /// Whether this event represents a build failure worth ingesting —
    /// anything with `action != "completed"` or `conclusion != "failure"`
    /// is dropped at the door (§6, invariant #7).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.action == "completed" && self.conclusion == "failure"
    }
}

/// Verify `body` against `signature_header` (the `sha256=<hex>` value of
/// the host's signature header) using HMAC-SHA256 over the raw request
/// body, with a constant-time comparison to avoid timing side channels.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    signature_header: &str,
) -> Result<(), WebhookError> {
    let hex_sig = signature_header
        .strip_prefix("sha256=")
        .ok_or(WebhookError::MissingSignature)?;
    let expected_bytes = hex::decode(hex_sig).map_err(|_| WebhookError::MissingSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if computed.ct_eq(&expected_bytes).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// Verify the signature and parse the body into an [`IngestEvent`] in one
/// step — the shape callers actually need at the HTTP boundary.
pub fn parse_verified_event(
    secret: &[u8],
    body: &[u8],
    signature_header: &str,
) -> Result<IngestEvent, WebhookError> {
    verify_signature(secret, body, signature_header)?;
    serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn verifies_correctly_signed_payload() {
        let secret = b"shared-secret";
        let body = br#"{"repo":"o/r"}"#;
        let sig = sign(secret, body);
        assert!(verify_signature(secret, body, &sig).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = b"shared-secret";
        let body = br#"{"repo":"o/r"}"#;
        let sig = sign(secret, body);
        let tampered = br#"{"repo":"o/r2"}"#;
        assert!(matches!(
            verify_signature(secret, tampered, &sig),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_missing_prefix() {
        let result = verify_signature(b"secret", b"body", "deadbeef");
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn parses_event_and_flags_non_failure_conclusions() {
        let secret = b"shared-secret";
        let body = br#"{"repo":"o/r","run_id":1,"sha":"abc","branch":"main","workflow_name":"ci","action":"completed","conclusion":"success"}"#;
        let sig = sign(secret, body);
        let event = parse_verified_event(secret, body, &sig).unwrap();
        assert!(!event.is_failure());
    }

    #[test]
    fn ignores_failure_conclusion_when_action_is_not_completed() {
        let secret = b"shared-secret";
        let body = br#"{"repo":"o/r","run_id":1,"sha":"abc","branch":"main","workflow_name":"ci","action":"in_progress","conclusion":"failure"}"#;
        let sig = sign(secret, body);
        let event = parse_verified_event(secret, body, &sig).unwrap();
        assert!(!event.is_failure());
    }

    #[test]
    fn accepts_completed_failure() {
        let secret = b"shared-secret";
        let body = br#"{"repo":"o/r","run_id":1,"sha":"abc","branch":"main","workflow_name":"ci","action":"completed","conclusion":"failure"}"#;
        let sig = sign(secret, body);
        let event = parse_verified_event(secret, body, &sig).unwrap();
        assert!(event.is_failure());
    }
}
