//! Reputation verdict cache.
//!
//! Keys are `reputation:{sha256(url)}` digests supplied by the caller; the
//! cache never sees raw vendor URLs. Fallback verdicts (breaker open,
//! timeout) are never written here, so a degraded threat feed cannot poison
//! the cache.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::LedgerError;
use crate::substrate::RedisSubstrate;

/// A cached threat-intel result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedVerdict {
    pub safe: bool,
    pub threat_tags: Vec<String>,
}

/// Capability interface for the verdict cache.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    async fn get(&self, url_digest: &str) -> Result<Option<CachedVerdict>, LedgerError>;
    async fn put(
        &self,
        url_digest: &str,
        verdict: &CachedVerdict,
        ttl: Duration,
    ) -> Result<(), LedgerError>;
}

fn cache_key(url_digest: &str) -> String {
    format!("reputation:{}", url_digest)
}

/// Redis-backed verdict cache.
pub struct RedisVerdictCache {
    substrate: RedisSubstrate,
}

impl RedisVerdictCache {
    pub fn new(substrate: RedisSubstrate) -> Self {
        Self { substrate }
    }
}

#[async_trait]
impl VerdictCache for RedisVerdictCache {
    async fn get(&self, url_digest: &str) -> Result<Option<CachedVerdict>, LedgerError> {
        let key = cache_key(url_digest);
        let mut conn = self.substrate.connection();
        let raw: Option<String> = self
            .substrate
            .bounded(async { redis::cmd("GET").arg(&key).query_async(&mut conn).await })
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        url_digest: &str,
        verdict: &CachedVerdict,
        ttl: Duration,
    ) -> Result<(), LedgerError> {
        let key = cache_key(url_digest);
        let json = serde_json::to_string(verdict)?;
        let secs = ttl.as_secs().max(1);
        let mut conn = self.substrate.connection();
        self.substrate
            .bounded(async {
                let reply: () = redis::cmd("SET")
                    .arg(&key)
                    .arg(json)
                    .arg("EX")
                    .arg(secs)
                    .query_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        Ok(())
    }
}

/// In-process verdict cache for tests and single-node development.
#[derive(Default)]
pub struct MemoryVerdictCache {
    entries: Mutex<HashMap<String, (CachedVerdict, Instant)>>,
}

impl MemoryVerdictCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictCache for MemoryVerdictCache {
    async fn get(&self, url_digest: &str) -> Result<Option<CachedVerdict>, LedgerError> {
        let key = cache_key(url_digest);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some((verdict, expires_at)) if Instant::now() < *expires_at => {
                Ok(Some(verdict.clone()))
            }
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        url_digest: &str,
        verdict: &CachedVerdict,
        ttl: Duration,
    ) -> Result<(), LedgerError> {
        let key = cache_key(url_digest);
        self.entries
            .lock()
            .insert(key, (verdict.clone(), Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(safe: bool, tags: &[&str]) -> CachedVerdict {
        CachedVerdict {
            safe,
            threat_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = MemoryVerdictCache::new();
        assert!(cache.get("abc123").await.unwrap().is_none());

        cache
            .put("abc123", &verdict(true, &[]), Duration::from_secs(300))
            .await
            .unwrap();
        let hit = cache.get("abc123").await.unwrap().unwrap();
        assert!(hit.safe);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryVerdictCache::new();
        cache
            .put(
                "evil",
                &verdict(false, &["MALWARE"]),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("evil").await.unwrap().is_none());
    }
}
