//! Vendor URL reputation with caching and fail-closed semantics.
//!
//! Lookup order: canonicalize, probe the verdict cache, then the threat feed
//! behind a dedicated breaker with an explicit timeout. Fresh verdicts are
//! cached with the service TTL bounded to five minutes. Verdicts produced by
//! a degraded path (timeout, transport failure, breaker open) are unsafe but
//! carry a synthetic `INFRA_*` tag and are never cached, so audit and
//! dashboards can tell an outage apart from a real threat.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use payguard_ledger::{CachedVerdict, VerdictCache};

use crate::breaker::{BreakerError, CircuitBreaker};

/// Upper bound on how long a verdict may live in the cache.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(300);

/// Synthetic tags for degraded lookups. Distinct from any real threat type.
pub const TAG_BREAKER_OPEN: &str = "INFRA_BREAKER_OPEN";
pub const TAG_LOOKUP_TIMEOUT: &str = "INFRA_LOOKUP_TIMEOUT";
pub const TAG_LOOKUP_FAILED: &str = "INFRA_LOOKUP_FAILED";
pub const TAG_MALFORMED_URL: &str = "MALFORMED_URL";

/// Threat feed errors.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("feed returned HTTP {0}")]
    Status(u16),
    #[error("undecodable feed response: {0}")]
    Decode(String),
    #[error("feed call timed out")]
    Timeout,
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// One match returned by the threat feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatMatch {
    pub threat_type: String,
    /// Service-supplied cache lifetime, if any.
    pub cache_ttl: Option<Duration>,
}

/// Transport seam for the threat-intel API.
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    /// Look up one canonical URL. An empty vec means no known threat.
    async fn lookup(&self, url: &str) -> Result<Vec<ThreatMatch>, FeedError>;
}

#[derive(Serialize)]
struct FeedRequest<'a> {
    client: FeedClient<'a>,
    #[serde(rename = "threatInfo")]
    threat_info: ThreatInfo<'a>,
}

#[derive(Serialize)]
struct FeedClient<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(rename = "clientVersion")]
    client_version: &'a str,
}

#[derive(Serialize)]
struct ThreatInfo<'a> {
    #[serde(rename = "threatTypes")]
    threat_types: Vec<&'a str>,
    #[serde(rename = "platformTypes")]
    platform_types: Vec<&'a str>,
    #[serde(rename = "threatEntryTypes")]
    threat_entry_types: Vec<&'a str>,
    #[serde(rename = "threatEntries")]
    threat_entries: Vec<ThreatEntry<'a>>,
}

#[derive(Serialize)]
struct ThreatEntry<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct FeedResponse {
    #[serde(default)]
    matches: Vec<FeedMatch>,
}

#[derive(Deserialize)]
struct FeedMatch {
    #[serde(rename = "threatType")]
    threat_type: String,
    #[serde(rename = "cacheDuration", default)]
    cache_duration: Option<String>,
}

/// HTTP threat feed client.
pub struct HttpThreatFeed {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpThreatFeed {
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
impl ThreatFeed for HttpThreatFeed {
    async fn lookup(&self, url: &str) -> Result<Vec<ThreatMatch>, FeedError> {
        let body = FeedRequest {
            client: FeedClient {
                client_id: "payguard",
                client_version: env!("CARGO_PKG_VERSION"),
            },
            threat_info: ThreatInfo {
                threat_types: vec!["MALWARE", "SOCIAL_ENGINEERING", "UNWANTED_SOFTWARE"],
                platform_types: vec!["ANY_PLATFORM"],
                threat_entry_types: vec!["URL"],
                threat_entries: vec![ThreatEntry { url }],
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        let parsed: FeedResponse = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        Ok(parsed
            .matches
            .into_iter()
            .map(|m| ThreatMatch {
                threat_type: m.threat_type,
                cache_ttl: m.cache_duration.as_deref().and_then(parse_duration_secs),
            })
            .collect())
    }
}

// "300s" and "300.5s" shapes; anything else is ignored.
fn parse_duration_secs(raw: &str) -> Option<Duration> {
    let trimmed = raw.strip_suffix('s')?;
    let secs: f64 = trimmed.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// The verdict the governance engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationVerdict {
    pub url: String,
    pub safe: bool,
    pub threat_tags: Vec<String>,
    /// Served from cache rather than a fresh lookup.
    pub from_cache: bool,
    /// Produced by a fallback path; not a statement about the vendor.
    pub degraded: bool,
}

impl ReputationVerdict {
    fn degraded(url: &str, tag: &str) -> Self {
        Self {
            url: url.to_string(),
            safe: false,
            threat_tags: vec![tag.to_string()],
            from_cache: false,
            degraded: true,
        }
    }
}

/// Reputation evaluator: cache, breaker, feed.
pub struct ReputationEvaluator {
    feed: Arc<dyn ThreatFeed>,
    cache: Arc<dyn VerdictCache>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
}

impl ReputationEvaluator {
    pub fn new(
        feed: Arc<dyn ThreatFeed>,
        cache: Arc<dyn VerdictCache>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            feed,
            cache,
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

    /// Evaluate a vendor URL. Never returns an error: infrastructure trouble
    /// becomes an unsafe, degraded verdict.
    pub async fn evaluate(&self, raw_url: &str) -> ReputationVerdict {
        let canonical = match canonicalize(raw_url) {
            Some(url) => url,
            None => {
                return ReputationVerdict {
                    url: raw_url.to_string(),
                    safe: false,
                    threat_tags: vec![TAG_MALFORMED_URL.to_string()],
                    from_cache: false,
                    degraded: false,
                }
            }
        };
        let digest = url_digest(&canonical);

        match self.cache.get(&digest).await {
            Ok(Some(cached)) => {
                return ReputationVerdict {
                    url: canonical,
                    safe: cached.safe,
                    threat_tags: cached.threat_tags,
                    from_cache: true,
                    degraded: false,
                }
            }
            Ok(None) => {}
            Err(err) => {
                // A cold cache is a miss, not an outage.
                tracing::warn!(error = %err, "verdict cache read failed");
            }
        }

        let feed = Arc::clone(&self.feed);
        let timeout = self.call_timeout;
        let lookup_url = canonical.clone();
        let outcome = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, feed.lookup(&lookup_url)).await {
                    Ok(result) => result,
                    Err(_) => Err(FeedError::Timeout),
                }
            })
            .await;

        match outcome {
            Ok(matches) => self.interpret(&canonical, matches).await,
            Err(BreakerError::Open) => {
                tracing::warn!(url = %canonical, "reputation breaker open, failing closed");
                ReputationVerdict::degraded(&canonical, TAG_BREAKER_OPEN)
            }
            Err(BreakerError::Inner(FeedError::Timeout)) => {
                tracing::warn!(url = %canonical, "reputation lookup timed out, failing closed");
                ReputationVerdict::degraded(&canonical, TAG_LOOKUP_TIMEOUT)
            }
            Err(BreakerError::Inner(err)) => {
                tracing::warn!(url = %canonical, error = %err, "reputation lookup failed, failing closed");
                ReputationVerdict::degraded(&canonical, TAG_LOOKUP_FAILED)
            }
        }
    }

    async fn interpret(&self, canonical: &str, matches: Vec<ThreatMatch>) -> ReputationVerdict {
        let safe = matches.is_empty();
        let threat_tags: Vec<String> = matches.iter().map(|m| m.threat_type.clone()).collect();
        let service_ttl = matches
            .iter()
            .filter_map(|m| m.cache_ttl)
            .min()
            .unwrap_or(MAX_CACHE_TTL);
        let ttl = service_ttl.min(MAX_CACHE_TTL);

        let cached = CachedVerdict {
            safe,
            threat_tags: threat_tags.clone(),
        };
        let digest = url_digest(canonical);
        if let Err(err) = self.cache.put(&digest, &cached, ttl).await {
            tracing::warn!(error = %err, "verdict cache write failed");
        }

        ReputationVerdict {
            url: canonical.to_string(),
            safe,
            threat_tags,
            from_cache: false,
            degraded: false,
        }
    }
}

/// Lowercased scheme+host+path form, query and fragment dropped.
pub fn canonicalize(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let path = parsed.path().trim_end_matches('/');
    Some(format!("{}://{}{}", scheme, host, path))
}

/// Hex SHA-256 of the canonical URL; the substrate cache key component.
pub fn url_digest(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
