//! Per-agent daily budget counters.
//!
//! The counter is the single atomic commit point of a governance cycle:
//! check-against-cap and increment happen in one indivisible step on the
//! substrate, never as read-modify-write in the caller. Keys are day-bounded
//! (`budget:{agent}:{yyyymmdd}` in UTC) so counters self-expire.
//!
//! A successful reserve hands back a [`ReservationToken`] naming the literal
//! key it incremented. Rollback operates on that token, so a cycle that
//! reserves just before UTC midnight and rolls back just after still releases
//! the day it actually reserved against, instead of going negative on the new
//! day's counter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::Script;
use std::collections::HashMap;

use crate::error::LedgerError;
use crate::substrate::RedisSubstrate;

/// Counters outlive the UTC day they cover by one hour so that cycles
/// straddling midnight still see their own reservation.
pub const COUNTER_TTL_SECS: u64 = 25 * 3600;

/// Proof of a successful reservation. Carries the exact counter key that was
/// incremented and the amount, so the rollback half of the operation cannot
/// land on a different day's key. Only the cycle that reserved holds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationToken {
    key: String,
    amount: i64,
}

impl ReservationToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }
}

/// Outcome of a reserve attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Amount reserved; `total` is the counter after the increment and
    /// `token` releases exactly this reservation.
    Reserved { total: i64, token: ReservationToken },
    /// Cap would be exceeded; counter untouched. `current` is the reserved
    /// total at the time of the check.
    Denied { current: i64 },
}

impl Reservation {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

/// Capability interface for the budget counter.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Atomically reserve `amount` against `daily_cap` for the current UTC
    /// day. Fails closed: substrate errors surface as `Err`, never as an
    /// implicit allow.
    async fn reserve(
        &self,
        agent_id: &str,
        amount: i64,
        daily_cap: i64,
    ) -> Result<Reservation, LedgerError>;

    /// Release the reservation named by `token`, decrementing the same key
    /// `reserve` incremented. A no-op when that key has already expired.
    async fn rollback(&self, token: &ReservationToken) -> Result<(), LedgerError>;

    /// Reserved total for the current UTC day (0 if absent). Advisory.
    async fn current(&self, agent_id: &str) -> Result<i64, LedgerError>;
}

/// Day-bounded counter key in UTC.
pub fn day_key(agent_id: &str) -> String {
    day_key_on(agent_id, Utc::now())
}

fn day_key_on(agent_id: &str, at: DateTime<Utc>) -> String {
    format!("budget:{}:{}", agent_id, at.format("%Y%m%d"))
}

// Check-and-reserve as one server-side step. Returns {reserved, total}:
// reserved is 0/1, total is the counter after (or at the time of a denial).
// The expiry is attached on the first write of the day.
const RESERVE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
if current + amount > cap then
    return {0, current}
end
local total = redis.call('INCRBY', KEYS[1], amount)
if total == amount then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
end
return {1, total}
"#;

// Decrement only a live key. DECRBY on an absent key would recreate it
// negative and without a TTL; an expired reservation died with its key.
const ROLLBACK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {0, 0}
end
local remaining = redis.call('DECRBY', KEYS[1], tonumber(ARGV[1]))
return {1, remaining}
"#;

/// Redis-backed budget ledger.
pub struct RedisBudgetLedger {
    substrate: RedisSubstrate,
    reserve_script: Script,
    rollback_script: Script,
}

impl RedisBudgetLedger {
    pub fn new(substrate: RedisSubstrate) -> Self {
        Self {
            substrate,
            reserve_script: Script::new(RESERVE_SCRIPT),
            rollback_script: Script::new(ROLLBACK_SCRIPT),
        }
    }
}

#[async_trait]
impl BudgetLedger for RedisBudgetLedger {
    async fn reserve(
        &self,
        agent_id: &str,
        amount: i64,
        daily_cap: i64,
    ) -> Result<Reservation, LedgerError> {
        let key = day_key(agent_id);
        let mut conn = self.substrate.connection();
        let mut invocation = self.reserve_script.prepare_invoke();
        invocation
            .key(&key)
            .arg(amount)
            .arg(daily_cap)
            .arg(COUNTER_TTL_SECS);
        let reply: Vec<i64> = self
            .substrate
            .bounded(invocation.invoke_async(&mut conn))
            .await?;
        match reply.as_slice() {
            [1, total] => Ok(Reservation::Reserved {
                total: *total,
                token: ReservationToken { key, amount },
            }),
            [0, current] => Ok(Reservation::Denied { current: *current }),
            other => Err(LedgerError::Corrupt(format!(
                "reserve script replied {:?}",
                other
            ))),
        }
    }

    async fn rollback(&self, token: &ReservationToken) -> Result<(), LedgerError> {
        let mut conn = self.substrate.connection();
        let mut invocation = self.rollback_script.prepare_invoke();
        invocation.key(token.key()).arg(token.amount());
        let reply: Vec<i64> = self
            .substrate
            .bounded(invocation.invoke_async(&mut conn))
            .await?;
        match reply.as_slice() {
            [1, remaining] => {
                tracing::debug!(key = %token.key(), amount = token.amount(), remaining, "budget rollback");
                Ok(())
            }
            [0, _] => {
                tracing::debug!(key = %token.key(), "budget rollback skipped, counter expired");
                Ok(())
            }
            other => Err(LedgerError::Corrupt(format!(
                "rollback script replied {:?}",
                other
            ))),
        }
    }

    async fn current(&self, agent_id: &str) -> Result<i64, LedgerError> {
        let key = day_key(agent_id);
        let mut conn = self.substrate.connection();
        let value: Option<i64> = self
            .substrate
            .bounded(async { redis::cmd("GET").arg(&key).query_async(&mut conn).await })
            .await?;
        Ok(value.unwrap_or(0))
    }
}

/// In-process budget ledger for tests and single-node development.
///
/// The mutex gives the same reserve-or-deny atomicity the Lua script gives on
/// Redis. Day-keyed entries are pruned lazily when a new day's key is first
/// touched.
#[derive(Default)]
pub struct MemoryBudgetLedger {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryBudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BudgetLedger for MemoryBudgetLedger {
    async fn reserve(
        &self,
        agent_id: &str,
        amount: i64,
        daily_cap: i64,
    ) -> Result<Reservation, LedgerError> {
        let key = day_key(agent_id);
        let mut counters = self.counters.lock();
        let prefix = format!("budget:{}:", agent_id);
        counters.retain(|k, _| !k.starts_with(&prefix) || *k == key);
        let current = counters.get(&key).copied().unwrap_or(0);
        if current + amount > daily_cap {
            return Ok(Reservation::Denied { current });
        }
        let total = current + amount;
        counters.insert(key.clone(), total);
        Ok(Reservation::Reserved {
            total,
            token: ReservationToken { key, amount },
        })
    }

    async fn rollback(&self, token: &ReservationToken) -> Result<(), LedgerError> {
        let mut counters = self.counters.lock();
        // Same guard as the Redis script: an expired or pruned key is not
        // recreated negative.
        if let Some(entry) = counters.get_mut(token.key()) {
            *entry -= token.amount();
        }
        Ok(())
    }

    async fn current(&self, agent_id: &str) -> Result<i64, LedgerError> {
        let key = day_key(agent_id);
        Ok(self.counters.lock().get(&key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn token_of(reservation: Reservation) -> ReservationToken {
        match reservation {
            Reservation::Reserved { token, .. } => token,
            Reservation::Denied { current } => panic!("denied at {current}"),
        }
    }

    #[tokio::test]
    async fn reserve_within_cap() {
        let ledger = MemoryBudgetLedger::new();
        let res = ledger.reserve("agent-1", 25_000, 500_000).await.unwrap();
        assert!(matches!(res, Reservation::Reserved { total: 25_000, .. }));
        assert_eq!(ledger.current("agent-1").await.unwrap(), 25_000);
    }

    #[tokio::test]
    async fn reserve_denied_leaves_counter_untouched() {
        let ledger = MemoryBudgetLedger::new();
        ledger.reserve("agent-1", 450_000, 500_000).await.unwrap();
        let res = ledger.reserve("agent-1", 75_000, 500_000).await.unwrap();
        assert_eq!(res, Reservation::Denied { current: 450_000 });
        assert_eq!(ledger.current("agent-1").await.unwrap(), 450_000);
    }

    #[tokio::test]
    async fn amount_equal_to_cap_is_reserved() {
        let ledger = MemoryBudgetLedger::new();
        let res = ledger.reserve("agent-1", 500_000, 500_000).await.unwrap();
        assert!(res.is_reserved());
    }

    #[tokio::test]
    async fn rollback_restores_exact_amount() {
        let ledger = MemoryBudgetLedger::new();
        let token = token_of(ledger.reserve("agent-1", 30_000, 500_000).await.unwrap());
        ledger.rollback(&token).await.unwrap();
        assert_eq!(ledger.current("agent-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn token_names_the_reserved_key() {
        let ledger = MemoryBudgetLedger::new();
        let token = token_of(ledger.reserve("agent-1", 10_000, 500_000).await.unwrap());
        assert_eq!(token.key(), day_key("agent-1"));
        assert_eq!(token.amount(), 10_000);
    }

    // A cycle that reserves before UTC midnight and rolls back after must
    // release the day it reserved against, not the new day.
    #[tokio::test]
    async fn rollback_lands_on_the_reserved_key_across_a_day_boundary() {
        let ledger = MemoryBudgetLedger::new();
        let yesterday = day_key_on("agent-1", Utc::now() - chrono::Duration::days(1));
        ledger.counters.lock().insert(yesterday.clone(), 30_000);
        let token = ReservationToken {
            key: yesterday.clone(),
            amount: 30_000,
        };

        ledger.rollback(&token).await.unwrap();

        assert_eq!(ledger.counters.lock().get(&yesterday), Some(&0));
        // Today's counter was never touched, so it is neither negative nor
        // granting extra headroom.
        assert_eq!(ledger.current("agent-1").await.unwrap(), 0);
        let res = ledger.reserve("agent-1", 500_000, 500_000).await.unwrap();
        assert!(matches!(res, Reservation::Reserved { total: 500_000, .. }));
    }

    #[tokio::test]
    async fn rollback_of_an_expired_counter_is_a_no_op() {
        let ledger = MemoryBudgetLedger::new();
        let token = ReservationToken {
            key: day_key("agent-1"),
            amount: 5_000,
        };

        ledger.rollback(&token).await.unwrap();

        // The absent key was not recreated negative.
        assert_eq!(ledger.current("agent-1").await.unwrap(), 0);
        assert!(ledger.counters.lock().is_empty());
    }

    #[tokio::test]
    async fn agents_do_not_share_counters() {
        let ledger = MemoryBudgetLedger::new();
        ledger.reserve("agent-a", 100, 1_000).await.unwrap();
        assert_eq!(ledger.current("agent-b").await.unwrap(), 0);
    }

    // With cap = 10a and 20 concurrent reserves of a, exactly 10 succeed and
    // the counter ends at 10a.
    #[tokio::test]
    async fn concurrent_reserves_respect_cap_exactly() {
        let ledger = Arc::new(MemoryBudgetLedger::new());
        let amount = 1_000i64;
        let cap = 10 * amount;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.reserve("agent-hot", amount, cap).await.unwrap()
            }));
        }

        let mut reserved = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Reservation::Reserved { .. } => reserved += 1,
                Reservation::Denied { .. } => denied += 1,
            }
        }

        assert_eq!(reserved, 10);
        assert_eq!(denied, 10);
        assert_eq!(ledger.current("agent-hot").await.unwrap(), cap);
    }
}
