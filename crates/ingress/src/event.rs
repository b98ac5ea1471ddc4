//! Payment-backend wire formats.
//!
//! One explicit parser shared by webhook push and poll pull. Required fields
//! are rejected when absent; unknown metadata entries are preserved in the
//! intent's annotations map instead of being dropped or coerced.

use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

use payguard_gate::{IntentError, PayoutIntent};

/// The only event type the pipeline acts on.
pub const QUEUED_EVENT: &str = "payout.queued";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("undecodable event body: {0}")]
    Json(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Invalid(#[from] IntentError),
}

/// The outer webhook event.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub event_type: String,
    pub payout: PayoutBody,
}

/// The inner payout object, shared with the pull contract.
#[derive(Debug, Deserialize)]
pub struct PayoutBody {
    pub id: String,
    /// Integer minor currency units.
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PayoutBody {
    /// Convert to a validated [`PayoutIntent`]. `metadata.agent_id` is
    /// required; `vendor_url` and `vendor_name` are lifted when present; all
    /// other metadata survives as annotations.
    pub fn into_intent(self) -> Result<PayoutIntent, ParseError> {
        let mut metadata = self.metadata;
        let agent_id = metadata
            .remove("agent_id")
            .and_then(value_to_string)
            .ok_or(ParseError::MissingField("metadata.agent_id"))?;
        let vendor_url = metadata.remove("vendor_url").and_then(value_to_string);
        let vendor_name = metadata.remove("vendor_name").and_then(value_to_string);

        let mut intent = PayoutIntent::new(self.id, agent_id, self.amount, self.currency);
        intent.vendor_url = vendor_url;
        intent.vendor_name = vendor_name;
        for (key, value) in metadata {
            let flat = value_to_string(&value).unwrap_or_else(|| value.to_string());
            intent.annotations.insert(key, flat);
        }

        intent.validate()?;
        Ok(intent)
    }
}

fn value_to_string(value: impl std::borrow::Borrow<serde_json::Value>) -> Option<String> {
    match value.borrow() {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse a raw webhook body.
pub fn parse_envelope(body: &[u8]) -> Result<WebhookEnvelope, ParseError> {
    serde_json::from_slice(body).map_err(|e| ParseError::Json(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_body() -> Vec<u8> {
        serde_json::json!({
            "event_type": "payout.queued",
            "payout": {
                "id": "po_1",
                "amount": 25000,
                "currency": "USD",
                "metadata": {
                    "agent_id": "agent-1",
                    "vendor_url": "https://safe.example",
                    "vendor_name": "Safe Vendor",
                    "invoice": "INV-42",
                    "batch": 7
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn parses_queued_event_into_intent() {
        let envelope = parse_envelope(&queued_body()).unwrap();
        assert_eq!(envelope.event_type, QUEUED_EVENT);

        let intent = envelope.payout.into_intent().unwrap();
        assert_eq!(intent.payout_id, "po_1");
        assert_eq!(intent.agent_id, "agent-1");
        assert_eq!(intent.amount_minor, 25_000);
        assert_eq!(intent.vendor_url.as_deref(), Some("https://safe.example"));
        // Unknown metadata survives as annotations.
        assert_eq!(intent.annotations.get("invoice").map(String::as_str), Some("INV-42"));
        assert_eq!(intent.annotations.get("batch").map(String::as_str), Some("7"));
        // Lifted fields are not duplicated.
        assert!(!intent.annotations.contains_key("agent_id"));
    }

    #[test]
    fn missing_agent_id_is_rejected() {
        let body = serde_json::json!({
            "event_type": "payout.queued",
            "payout": { "id": "po_2", "amount": 100, "currency": "USD", "metadata": {} }
        })
        .to_string();

        let envelope = parse_envelope(body.as_bytes()).unwrap();
        assert!(matches!(
            envelope.payout.into_intent(),
            Err(ParseError::MissingField("metadata.agent_id"))
        ));
    }

    #[test]
    fn invalid_amount_is_rejected() {
        let body = serde_json::json!({
            "event_type": "payout.queued",
            "payout": {
                "id": "po_3", "amount": -5, "currency": "USD",
                "metadata": { "agent_id": "agent-1" }
            }
        })
        .to_string();

        let envelope = parse_envelope(body.as_bytes()).unwrap();
        assert!(matches!(
            envelope.payout.into_intent(),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_body_is_a_json_error() {
        assert!(matches!(
            parse_envelope(b"not json"),
            Err(ParseError::Json(_))
        ));
    }
}
