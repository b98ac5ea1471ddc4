//! Vendor legal-entity verification. Advisory only.
//!
//! A failure, timeout, or negative result never flips a governance decision;
//! the report enriches audit detail and risk annotations. Fail-open by
//! construction: every degraded path collapses to "unverified".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::reputation::FeedError;

/// A directory record for a legal entity.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityRecord {
    pub legal_name: String,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// What the engine attaches to audit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityReport {
    pub verified: bool,
    pub legal_name: Option<String>,
    pub jurisdiction: Option<String>,
    pub status: Option<String>,
}

impl IdentityReport {
    fn unverified() -> Self {
        Self::default()
    }
}

/// Transport seam for the identity directory.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Look up a vendor by display name or identifier.
    async fn lookup(&self, query: &str) -> Result<Option<IdentityRecord>, FeedError>;
}

#[derive(Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    records: Vec<IdentityRecord>,
}

/// HTTP identity directory client.
pub struct HttpIdentityDirectory {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpIdentityDirectory {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl IdentityDirectory for HttpIdentityDirectory {
    async fn lookup(&self, query: &str) -> Result<Option<IdentityRecord>, FeedError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        let parsed: DirectoryResponse = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;
        Ok(parsed.records.into_iter().next())
    }
}

/// Identity verifier with its own breaker and a short timeout.
pub struct IdentityVerifier {
    directory: Arc<dyn IdentityDirectory>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
}

impl IdentityVerifier {
    pub fn new(directory: Arc<dyn IdentityDirectory>, breaker: CircuitBreaker) -> Self {
        Self {
            directory,
            breaker,
            call_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn breaker_snapshot(&self) -> crate::breaker::BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Verify a vendor by name or identifier. Never errors.
    pub async fn verify(&self, query: &str) -> IdentityReport {
        let directory = Arc::clone(&self.directory);
        let timeout = self.call_timeout;
        let owned = query.to_string();
        let outcome = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, directory.lookup(&owned)).await {
                    Ok(result) => result,
                    Err(_) => Err(FeedError::Timeout),
                }
            })
            .await;

        match outcome {
            Ok(Some(record)) => IdentityReport {
                verified: true,
                legal_name: Some(record.legal_name),
                jurisdiction: record.jurisdiction,
                status: record.status,
            },
            Ok(None) => IdentityReport::unverified(),
            Err(BreakerError::Open) => {
                tracing::debug!(query = %query, "identity breaker open, proceeding unverified");
                IdentityReport::unverified()
            }
            Err(BreakerError::Inner(err)) => {
                tracing::debug!(query = %query, error = %err, "identity lookup failed, proceeding unverified");
                IdentityReport::unverified()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    struct FixedDirectory(Option<IdentityRecord>);

    #[async_trait]
    impl IdentityDirectory for FixedDirectory {
        async fn lookup(&self, _query: &str) -> Result<Option<IdentityRecord>, FeedError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDirectory;

    #[async_trait]
    impl IdentityDirectory for BrokenDirectory {
        async fn lookup(&self, _query: &str) -> Result<Option<IdentityRecord>, FeedError> {
            Err(FeedError::Transport("down".into()))
        }
    }

    #[tokio::test]
    async fn known_vendor_is_verified() {
        let verifier = IdentityVerifier::new(
            Arc::new(FixedDirectory(Some(IdentityRecord {
                legal_name: "Acme Corp".into(),
                jurisdiction: Some("US-DE".into()),
                status: Some("ACTIVE".into()),
            }))),
            CircuitBreaker::new("identity", BreakerConfig::default()),
        );

        let report = verifier.verify("Acme").await;
        assert!(report.verified);
        assert_eq!(report.legal_name.as_deref(), Some("Acme Corp"));
    }

    #[tokio::test]
    async fn unknown_vendor_is_unverified() {
        let verifier = IdentityVerifier::new(
            Arc::new(FixedDirectory(None)),
            CircuitBreaker::new("identity", BreakerConfig::default()),
        );
        let report = verifier.verify("Nobody LLC").await;
        assert!(!report.verified);
    }

    #[tokio::test]
    async fn directory_outage_fails_open() {
        let verifier = IdentityVerifier::new(
            Arc::new(BrokenDirectory),
            CircuitBreaker::new("identity", BreakerConfig::default()),
        );
        let report = verifier.verify("Acme").await;
        assert!(!report.verified);
        assert!(report.legal_name.is_none());
    }
}
