//! At-most-once gate keyed by payout id.
//!
//! The claim is a single set-if-absent round trip with the expiry attached in
//! the same command. A separate set-then-expire pair is forbidden: a crash
//! between the two leaks the key forever.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::LedgerError;
use crate::substrate::RedisSubstrate;

/// Marks outlive the widest realistic webhook-retry window.
pub const MARK_TTL_SECS: u64 = 48 * 3600;

/// Outcome of an idempotency claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    FirstSeen,
    AlreadySeen,
}

/// Capability interface for the idempotency registry.
#[async_trait]
pub trait IdempotencyGate: Send + Sync {
    /// Claim `payout_id`. At most one caller across all processes observes
    /// `FirstSeen` within the retention window. Substrate errors surface as
    /// `Err`; the engine treats them as fail-closed.
    async fn claim(&self, payout_id: &str) -> Result<Claim, LedgerError>;
}

fn mark_key(payout_id: &str) -> String {
    format!("idem:{}", payout_id)
}

/// Redis-backed idempotency gate.
pub struct RedisIdempotencyGate {
    substrate: RedisSubstrate,
}

impl RedisIdempotencyGate {
    pub fn new(substrate: RedisSubstrate) -> Self {
        Self { substrate }
    }
}

#[async_trait]
impl IdempotencyGate for RedisIdempotencyGate {
    async fn claim(&self, payout_id: &str) -> Result<Claim, LedgerError> {
        let key = mark_key(payout_id);
        let mut conn = self.substrate.connection();
        // SET NX EX: value, absence check, and expiry in one round trip.
        let reply: Option<String> = self
            .substrate
            .bounded(async {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(MARK_TTL_SECS)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        match reply {
            Some(_) => Ok(Claim::FirstSeen),
            None => Ok(Claim::AlreadySeen),
        }
    }
}

/// In-process idempotency gate for tests and single-node development.
#[derive(Default)]
pub struct MemoryIdempotencyGate {
    marks: Mutex<HashMap<String, Instant>>,
    ttl: Option<Duration>,
}

impl MemoryIdempotencyGate {
    pub fn new() -> Self {
        Self {
            marks: Mutex::new(HashMap::new()),
            ttl: Some(Duration::from_secs(MARK_TTL_SECS)),
        }
    }

    /// Shortened retention, for expiry tests.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            marks: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }
}

#[async_trait]
impl IdempotencyGate for MemoryIdempotencyGate {
    async fn claim(&self, payout_id: &str) -> Result<Claim, LedgerError> {
        let key = mark_key(payout_id);
        let mut marks = self.marks.lock();
        if let Some(ttl) = self.ttl {
            marks.retain(|_, seen_at| seen_at.elapsed() < ttl);
        }
        if marks.contains_key(&key) {
            return Ok(Claim::AlreadySeen);
        }
        marks.insert(key, Instant::now());
        Ok(Claim::FirstSeen)
    }
}
