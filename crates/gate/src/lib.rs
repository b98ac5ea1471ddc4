//! PayGuard-Gate: the governance core
//!
//! A deterministic evaluator that turns a payout intent into a decision
//! (APPROVED, REJECTED, HELD, SKIPPED) with atomic budget accounting, vendor
//! screening, and an immutable audit trail. Financially conservative: every
//! infrastructure failure on a money-moving path fails closed, and the spend
//! ledger never drifts from the sum of approved and held amounts.
//!
//! Modules:
//! - [`types`]: the closed data model (intents, policies, decisions, records)
//! - [`policy`]: durable per-agent policy store
//! - [`audit`]: append-only decision log with a local fallback path
//! - [`engine`]: the decision matrix and its rollback discipline
//! - [`metrics`]: process-wide counters and latency samples

pub mod audit;
pub mod engine;
pub mod metrics;
pub mod policy;
pub mod types;

pub use audit::{AuditError, AuditFilter, AuditSink, MemoryAuditSink, SqlAuditSink};
pub use engine::{
    ApprovalNotifier, EngineError, GovernanceEngine, HeldSummary, NotifyError, PaymentActionError,
    PaymentActions,
};
pub use policy::{MemoryPolicyStore, PolicyError, PolicyStore, SqlPolicyStore};
pub use types::{
    vendor_host, AgentPolicy, AuditRecord, BudgetView, Decision, DecisionOutcome, IntentError,
    PayoutIntent, PolicyViolation, ReasonCode,
};
