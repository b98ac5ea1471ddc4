//! Signature-verified webhook intake (push mode).
//!
//! The signature header is a hex-encoded HMAC-SHA256 over the raw body with
//! the shared secret. Verification goes through the `Mac` primitive, whose
//! comparison is constant time. Unverified requests get a 401 and never
//! reach the engine; malformed bodies get a 400 and are not audited as
//! governance decisions; verified duplicates come back 200 with a SKIPPED
//! decision from the idempotency gate.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use payguard_gate::metrics::METRICS;

use crate::event::{self, QUEUED_EVENT};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Signature header set by the payment backend.
pub const SIGNATURE_HEADER: &str = "x-payment-signature";

/// Verify a hex HMAC-SHA256 signature over `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Sign a body the way the backend does. Test and tooling helper.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// POST /hooks/payments
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let Some(signature) = signature else {
        METRICS.record_signature_rejection();
        return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
    };
    if !verify_signature(state.webhook_secret.expose(), &body, signature) {
        METRICS.record_signature_rejection();
        tracing::warn!("webhook rejected: signature mismatch");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let envelope = match event::parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "webhook rejected: malformed body");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    if envelope.event_type != QUEUED_EVENT {
        tracing::debug!(event_type = %envelope.event_type, "webhook event ignored");
        return Json(serde_json::json!({ "status": "ignored" })).into_response();
    }

    let intent = match envelope.payout.into_intent() {
        Ok(intent) => intent,
        Err(err) => {
            tracing::warn!(error = %err, "webhook rejected: invalid payout");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    // Backpressure: beyond the in-flight limit, push callers are deferred.
    let Ok(permit) = Arc::clone(&state.inflight).try_acquire_owned() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "at capacity, retry later").into_response();
    };

    // The cycle runs detached so a client disconnect cannot abandon it
    // between the reservation and the audit commit.
    let engine = Arc::clone(&state.engine);
    let cycle = tokio::spawn(async move {
        let _permit = permit;
        engine.decide(intent).await
    });

    match cycle.await {
        Ok(Ok(outcome)) => Json(outcome).into_response(),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "governance cycle could not commit");
            (StatusCode::INTERNAL_SERVER_ERROR, "decision could not be committed").into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "governance cycle task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "decision task failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn signature_round_trip() {
        let body = br#"{"event_type":"payout.queued"}"#;
        let signature = sign(SECRET, body);
        assert!(verify_signature(SECRET, body, &signature));
    }

    #[test]
    fn tampered_body_fails() {
        let signature = sign(SECRET, b"original");
        assert!(!verify_signature(SECRET, b"tampered", &signature));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let signature = sign("other_secret", body);
        assert!(!verify_signature(SECRET, body, &signature));
    }

    #[test]
    fn non_hex_signature_fails() {
        assert!(!verify_signature(SECRET, b"payload", "zz-not-hex"));
    }

    #[test]
    fn truncated_signature_fails() {
        let body = b"payload";
        let signature = sign(SECRET, body);
        assert!(!verify_signature(SECRET, body, &signature[..32]));
    }
}
