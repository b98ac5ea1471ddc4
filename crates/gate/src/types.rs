//! The governance data model.
//!
//! Decisions and reason codes are closed enums so the decision matrix stays
//! exhaustive: adding a variant without updating the engine is a compile
//! error, not a runtime surprise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Intent construction / validation errors.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("currency must be a three-letter code, got {0:?}")]
    BadCurrency(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

/// An agent-originated request to move money. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutIntent {
    /// Opaque unique payout identifier.
    pub payout_id: String,
    pub agent_id: String,
    /// Integer minor currency units.
    pub amount_minor: i64,
    /// Three-letter currency code.
    pub currency: String,
    pub vendor_name: Option<String>,
    pub vendor_url: Option<String>,
    /// Caller-supplied annotations, preserved verbatim.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl PayoutIntent {
    pub fn new(
        payout_id: impl Into<String>,
        agent_id: impl Into<String>,
        amount_minor: i64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            payout_id: payout_id.into(),
            agent_id: agent_id.into(),
            amount_minor,
            currency: currency.into(),
            vendor_name: None,
            vendor_url: None,
            annotations: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_vendor(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.vendor_name = Some(name.into());
        self.vendor_url = Some(url.into());
        self
    }

    pub fn with_vendor_url(mut self, url: impl Into<String>) -> Self {
        self.vendor_url = Some(url.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), IntentError> {
        if self.payout_id.is_empty() {
            return Err(IntentError::MissingField("payout_id"));
        }
        if self.agent_id.is_empty() {
            return Err(IntentError::MissingField("agent_id"));
        }
        if self.amount_minor <= 0 {
            return Err(IntentError::NonPositiveAmount(self.amount_minor));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(IntentError::BadCurrency(self.currency.clone()));
        }
        Ok(())
    }
}

/// Terminal governance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
    Held,
    Skipped,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Held => "HELD",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "HELD" => Some(Self::Held),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    PolicyOk,
    NoPolicy,
    LimitExceeded,
    TxnLimitExceeded,
    DomainBlocked,
    RiskHigh,
    ApprovalRequired,
    IdempotentSkip,
    InvalidSignature,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyOk => "POLICY_OK",
            Self::NoPolicy => "NO_POLICY",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::TxnLimitExceeded => "TXN_LIMIT_EXCEEDED",
            Self::DomainBlocked => "DOMAIN_BLOCKED",
            Self::RiskHigh => "RISK_HIGH",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::IdempotentSkip => "IDEMPOTENT_SKIP",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "POLICY_OK" => Some(Self::PolicyOk),
            "NO_POLICY" => Some(Self::NoPolicy),
            "LIMIT_EXCEEDED" => Some(Self::LimitExceeded),
            "TXN_LIMIT_EXCEEDED" => Some(Self::TxnLimitExceeded),
            "DOMAIN_BLOCKED" => Some(Self::DomainBlocked),
            "RISK_HIGH" => Some(Self::RiskHigh),
            "APPROVAL_REQUIRED" => Some(Self::ApprovalRequired),
            "IDEMPOTENT_SKIP" => Some(Self::IdempotentSkip),
            "INVALID_SIGNATURE" => Some(Self::InvalidSignature),
            "INTERNAL_ERROR" => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// What the engine hands back to the ingress.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub payout_id: String,
    pub decision: Decision,
    pub reason: ReasonCode,
    pub detail: String,
    pub threat_tags: Vec<String>,
    pub processing_ms: u64,
}

/// Per-agent governance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub agent_id: String,
    /// Daily spending cap in minor units.
    pub daily_cap_minor: i64,
    /// Optional per-transaction cap; strict `>` comparison.
    pub per_txn_cap_minor: Option<i64>,
    /// Amounts at or above this are held for human approval.
    pub approval_threshold_minor: Option<i64>,
    /// Empty means any domain passes the allowlist check.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentPolicy {
    pub fn new(agent_id: impl Into<String>, daily_cap_minor: i64) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            daily_cap_minor,
            per_txn_cap_minor: None,
            approval_threshold_minor: None,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_per_txn_cap(mut self, cap_minor: i64) -> Self {
        self.per_txn_cap_minor = Some(cap_minor);
        self
    }

    pub fn with_approval_threshold(mut self, threshold_minor: i64) -> Self {
        self.approval_threshold_minor = Some(threshold_minor);
        self
    }

    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    pub fn with_blocked_domains(mut self, domains: Vec<String>) -> Self {
        self.blocked_domains = domains;
        self
    }

    /// Normalize domain lists and check the structural invariants.
    pub fn validate(&mut self) -> Result<(), PolicyViolation> {
        if self.agent_id.is_empty() {
            return Err(PolicyViolation::MissingAgentId);
        }
        if self.daily_cap_minor < 0 {
            return Err(PolicyViolation::NegativeCap("daily_cap"));
        }
        if let Some(cap) = self.per_txn_cap_minor {
            if cap < 0 {
                return Err(PolicyViolation::NegativeCap("per_txn_cap"));
            }
            if cap > self.daily_cap_minor {
                return Err(PolicyViolation::TxnCapAboveDailyCap {
                    per_txn: cap,
                    daily: self.daily_cap_minor,
                });
            }
        }
        if let Some(threshold) = self.approval_threshold_minor {
            if threshold < 0 {
                return Err(PolicyViolation::NegativeCap("approval_threshold"));
            }
        }
        for list in [&mut self.allowed_domains, &mut self.blocked_domains] {
            for domain in list.iter_mut() {
                *domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            }
            list.retain(|d| !d.is_empty());
            list.sort();
            list.dedup();
        }
        if let Some(overlap) = self
            .allowed_domains
            .iter()
            .find(|d| self.blocked_domains.contains(d))
        {
            return Err(PolicyViolation::DomainInBothLists(overlap.clone()));
        }
        Ok(())
    }

    pub fn is_domain_blocked(&self, host: &str) -> bool {
        self.blocked_domains.iter().any(|d| domain_matches(host, d))
    }

    /// True when the allowlist is empty or the host falls under an entry.
    pub fn is_domain_allowed(&self, host: &str) -> bool {
        self.allowed_domains.is_empty()
            || self.allowed_domains.iter().any(|d| domain_matches(host, d))
    }
}

/// Structural policy invariant violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("policy is missing an agent id")]
    MissingAgentId,
    #[error("{0} must be non-negative")]
    NegativeCap(&'static str),
    #[error("per_txn_cap {per_txn} exceeds daily_cap {daily}")]
    TxnCapAboveDailyCap { per_txn: i64, daily: i64 },
    #[error("domain {0:?} appears in both allowed and blocked lists")]
    DomainInBothLists(String),
}

/// Case-insensitive registered-domain suffix match: `pay.evil.example`
/// matches the entry `evil.example`.
fn domain_matches(host: &str, entry: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let entry = entry.to_ascii_lowercase();
    host == entry || host.ends_with(&format!(".{}", entry))
}

/// Lowercased host of a vendor URL, if it parses as http(s).
pub fn vendor_host(raw_url: &str) -> Option<String> {
    let parsed = Url::parse(raw_url).ok()?;
    match parsed.scheme() {
        "http" | "https" => parsed.host_str().map(|h| h.to_ascii_lowercase()),
        _ => None,
    }
}

/// The persistent decision trace. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub payout_id: String,
    pub agent_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub vendor_name: Option<String>,
    pub vendor_url: Option<String>,
    pub decision: Decision,
    pub reason: ReasonCode,
    pub detail: String,
    pub threat_tags: Vec<String>,
    pub processing_ms: u64,
    pub committed_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_outcome(intent: &PayoutIntent, outcome: &DecisionOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            payout_id: intent.payout_id.clone(),
            agent_id: intent.agent_id.clone(),
            amount_minor: intent.amount_minor,
            currency: intent.currency.clone(),
            vendor_name: intent.vendor_name.clone(),
            vendor_url: intent.vendor_url.clone(),
            decision: outcome.decision,
            reason: outcome.reason,
            detail: outcome.detail.clone(),
            threat_tags: outcome.threat_tags.clone(),
            processing_ms: outcome.processing_ms,
            committed_at: Utc::now(),
        }
    }
}

/// Budget snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetView {
    pub agent_id: String,
    pub daily_cap_minor: i64,
    pub spent_minor: i64,
    pub remaining_minor: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_validation() {
        let good = PayoutIntent::new("po_1", "agent-1", 1000, "USD");
        assert!(good.validate().is_ok());

        let zero = PayoutIntent::new("po_2", "agent-1", 0, "USD");
        assert!(matches!(
            zero.validate(),
            Err(IntentError::NonPositiveAmount(0))
        ));

        let currency = PayoutIntent::new("po_3", "agent-1", 1000, "usdollar");
        assert!(matches!(currency.validate(), Err(IntentError::BadCurrency(_))));
    }

    #[test]
    fn policy_validation_normalizes_domains() {
        let mut policy = AgentPolicy::new("agent-1", 500_000)
            .with_blocked_domains(vec!["Evil.Example.".into(), "evil.example".into()]);
        policy.validate().unwrap();
        assert_eq!(policy.blocked_domains, vec!["evil.example"]);
    }

    #[test]
    fn policy_rejects_txn_cap_above_daily() {
        let mut policy = AgentPolicy::new("agent-1", 100).with_per_txn_cap(200);
        assert!(matches!(
            policy.validate(),
            Err(PolicyViolation::TxnCapAboveDailyCap { .. })
        ));
    }

    #[test]
    fn policy_rejects_overlapping_domain_lists() {
        let mut policy = AgentPolicy::new("agent-1", 100)
            .with_allowed_domains(vec!["good.example".into()])
            .with_blocked_domains(vec!["GOOD.example".into()]);
        assert!(matches!(
            policy.validate(),
            Err(PolicyViolation::DomainInBothLists(_))
        ));
    }

    #[test]
    fn domain_matching_is_suffix_based() {
        let policy =
            AgentPolicy::new("agent-1", 100).with_blocked_domains(vec!["evil.example".into()]);
        assert!(policy.is_domain_blocked("evil.example"));
        assert!(policy.is_domain_blocked("pay.evil.example"));
        assert!(!policy.is_domain_blocked("notevil.example"));
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let policy = AgentPolicy::new("agent-1", 100);
        assert!(policy.is_domain_allowed("anything.example"));

        let restricted =
            AgentPolicy::new("agent-1", 100).with_allowed_domains(vec!["good.example".into()]);
        assert!(restricted.is_domain_allowed("api.good.example"));
        assert!(!restricted.is_domain_allowed("bad.example"));
    }

    #[test]
    fn vendor_host_extraction() {
        assert_eq!(
            vendor_host("https://Pay.Vendor.Example/checkout").as_deref(),
            Some("pay.vendor.example")
        );
        assert_eq!(vendor_host("ftp://vendor.example"), None);
        assert_eq!(vendor_host("not a url"), None);
    }

    #[test]
    fn reason_codes_round_trip_their_wire_names() {
        for reason in [
            ReasonCode::PolicyOk,
            ReasonCode::NoPolicy,
            ReasonCode::LimitExceeded,
            ReasonCode::TxnLimitExceeded,
            ReasonCode::DomainBlocked,
            ReasonCode::RiskHigh,
            ReasonCode::ApprovalRequired,
            ReasonCode::IdempotentSkip,
            ReasonCode::InvalidSignature,
            ReasonCode::InternalError,
        ] {
            assert_eq!(ReasonCode::parse(reason.as_str()), Some(reason));
        }
    }
}
