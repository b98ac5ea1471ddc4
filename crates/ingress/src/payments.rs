//! Reqwest client for the payment backend's pull contract.
//!
//! Lists intents in the queued state, approves by id, cancels by id with a
//! reason. Status mapping follows the engine's retry taxonomy: 4xx is fatal
//! (no retry), 5xx and transport failures are retriable and feed the poll
//! loop's backoff.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use payguard_gate::{PaymentActionError, PaymentActions, PayoutIntent};

use crate::config::Secret;
use crate::event::PayoutBody;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    payouts: Vec<PayoutBody>,
}

/// HTTP payment-backend client.
pub struct PaymentClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret,
}

impl PaymentClient {
    pub fn new(base_url: impl Into<String>, api_key: Secret) -> Result<Self, PaymentActionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| PaymentActionError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn classify(status: reqwest::StatusCode, body: String) -> PaymentActionError {
        if status.is_client_error() {
            PaymentActionError::Fatal(format!("HTTP {}: {}", status.as_u16(), body))
        } else {
            PaymentActionError::Retriable(format!("HTTP {}: {}", status.as_u16(), body))
        }
    }

    async fn post_action(&self, path: String, body: serde_json::Value) -> Result<(), PaymentActionError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(Self::classify(status, text))
    }
}

fn transport(err: reqwest::Error) -> PaymentActionError {
    PaymentActionError::Retriable(err.to_string())
}

#[async_trait]
impl PaymentActions for PaymentClient {
    async fn list_queued(&self) -> Result<Vec<PayoutIntent>, PaymentActionError> {
        let response = self
            .client
            .get(format!("{}/payouts", self.base_url))
            .query(&[("status", "queued")])
            .bearer_auth(self.api_key.expose())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, text));
        }

        let listed: ListResponse = response
            .json()
            .await
            .map_err(|e| PaymentActionError::Retriable(format!("undecodable list body: {e}")))?;

        // A payout the parser cannot shape is skipped, not fatal for the
        // whole batch.
        let mut intents = Vec::with_capacity(listed.payouts.len());
        for payout in listed.payouts {
            match payout.into_intent() {
                Ok(intent) => intents.push(intent),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unparsable queued payout");
                }
            }
        }
        Ok(intents)
    }

    async fn approve(&self, payout_id: &str) -> Result<(), PaymentActionError> {
        self.post_action(
            format!("/payouts/{payout_id}/approve"),
            serde_json::json!({}),
        )
        .await
    }

    async fn cancel(&self, payout_id: &str, reason: &str) -> Result<(), PaymentActionError> {
        self.post_action(
            format!("/payouts/{payout_id}/cancel"),
            serde_json::json!({ "reason": reason }),
        )
        .await
    }
}
