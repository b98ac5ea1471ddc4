//! Approval notifications for HELD payouts.
//!
//! Posts a JSON summary to a configured webhook. A primary delivery failure
//! falls through to the optional secondary transport; the engine logs and
//! counts a failure but never changes the decision.

use async_trait::async_trait;
use std::time::Duration;

use payguard_gate::{ApprovalNotifier, HeldSummary, NotifyError};

/// Webhook-backed approval notifier.
pub struct WebhookApprovalNotifier {
    client: reqwest::Client,
    primary_url: String,
    secondary_url: Option<String>,
}

impl WebhookApprovalNotifier {
    pub fn new(primary_url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(Self {
            client,
            primary_url: primary_url.into(),
            secondary_url: None,
        })
    }

    pub fn with_secondary(mut self, url: impl Into<String>) -> Self {
        self.secondary_url = Some(url.into());
        self
    }

    fn payload(summary: &HeldSummary) -> serde_json::Value {
        serde_json::json!({
            "event_type": "payout.held",
            "payout_id": summary.payout_id,
            "agent_id": summary.agent_id,
            "amount_minor": summary.amount_minor,
            "currency": summary.currency,
            "vendor_name": summary.vendor_name,
            "vendor_url": summary.vendor_url,
            "detail": summary.detail,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    async fn deliver(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError(format!("HTTP {}", status.as_u16())))
        }
    }
}

#[async_trait]
impl ApprovalNotifier for WebhookApprovalNotifier {
    async fn notify(&self, summary: &HeldSummary) -> Result<(), NotifyError> {
        let payload = Self::payload(summary);

        let primary_err = match self.deliver(&self.primary_url, &payload).await {
            Ok(()) => {
                tracing::info!(payout_id = %summary.payout_id, "approval notification delivered");
                return Ok(());
            }
            Err(err) => err,
        };

        let Some(secondary) = &self.secondary_url else {
            return Err(primary_err);
        };

        tracing::warn!(
            payout_id = %summary.payout_id,
            error = %primary_err,
            "primary notification failed, trying secondary transport"
        );
        self.deliver(secondary, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_the_hold_context() {
        let summary = HeldSummary {
            payout_id: "po_5".into(),
            agent_id: "agent-1".into(),
            amount_minor: 60_000,
            currency: "USD".into(),
            vendor_name: Some("Safe Vendor".into()),
            vendor_url: Some("https://safe.example".into()),
            detail: "amount 60000 meets approval threshold 50000".into(),
        };

        let payload = WebhookApprovalNotifier::payload(&summary);
        assert_eq!(payload["event_type"], "payout.held");
        assert_eq!(payload["payout_id"], "po_5");
        assert_eq!(payload["amount_minor"], 60_000);
    }
}
