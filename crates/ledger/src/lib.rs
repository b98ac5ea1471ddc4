//! PayGuard-Ledger: fast key/value substrate
//!
//! Owns the three kinds of shared fast state the governance pipeline mutates:
//! - Per-agent daily budget counters (atomic check-and-reserve with rollback)
//! - Idempotency marks (at-most-once gate per payout id)
//! - Reputation verdict cache (short-TTL threat-intel results)
//!
//! Every mutation goes through a documented atomic operation. Redis is the
//! shipped backend; in-memory twins back tests and single-node development.
//! All Redis round trips run under an explicit per-call timeout and fail
//! closed: an unreachable substrate is an error, never a silent allow.

pub mod budget;
pub mod cache;
pub mod error;
pub mod idempotency;
pub mod substrate;

pub use budget::{
    BudgetLedger, MemoryBudgetLedger, RedisBudgetLedger, Reservation, ReservationToken,
};
pub use cache::{CachedVerdict, MemoryVerdictCache, RedisVerdictCache, VerdictCache};
pub use error::LedgerError;
pub use idempotency::{Claim, IdempotencyGate, MemoryIdempotencyGate, RedisIdempotencyGate};
pub use substrate::RedisSubstrate;
