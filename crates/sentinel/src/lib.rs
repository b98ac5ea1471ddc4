//! PayGuard-Sentinel: external risk intelligence
//!
//! Everything the governance engine consults beyond its own ledger lives
//! here, each dependency behind its own circuit breaker:
//! - Vendor URL reputation (threat intel, fail-closed)
//! - Vendor legal-entity identity (advisory, fail-open)
//! - Per-agent transaction anomaly scoring (advisory, off-thread inference)

pub mod anomaly;
pub mod breaker;
pub mod identity;
pub mod reputation;

pub use anomaly::{AnomalyScorer, RiskAssessment};
pub use breaker::{BreakerConfig, BreakerError, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use identity::{HttpIdentityDirectory, IdentityDirectory, IdentityRecord, IdentityReport, IdentityVerifier};
pub use reputation::{
    FeedError, HttpThreatFeed, ReputationEvaluator, ReputationVerdict, ThreatFeed, ThreatMatch,
};
