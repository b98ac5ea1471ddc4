//! The governance engine: one payout intent in, one committed decision out.
//!
//! Steps, in order: idempotency claim, policy fetch, per-transaction cap,
//! atomic budget reserve, domain blocklist, domain allowlist, vendor
//! reputation, approval threshold, commit. The per-transaction cap runs
//! before the reservation so oversized requests never inflate the counter;
//! domain and reputation checks run after it so a denied reservation
//! short-circuits the external work. Every check after the reservation rolls
//! back on rejection, and no decision is returned before the audit commit
//! succeeds at least to the fallback path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use payguard_ledger::{
    BudgetLedger, Claim, IdempotencyGate, LedgerError, Reservation, ReservationToken,
};
use payguard_sentinel::{AnomalyScorer, IdentityVerifier, ReputationEvaluator};

use crate::audit::{AuditError, AuditSink};
use crate::metrics::METRICS;
use crate::policy::{PolicyError, PolicyStore};
use crate::types::{
    vendor_host, AuditRecord, BudgetView, Decision, DecisionOutcome, IntentError, PayoutIntent,
    ReasonCode,
};

/// Default end-to-end budget for one governance cycle.
pub const DEFAULT_CYCLE_DEADLINE: Duration = Duration::from_secs(10);

/// Errors from the payment-action collaborator.
#[derive(Debug, Error)]
pub enum PaymentActionError {
    /// 4xx-class: the backend rejected the request; retrying cannot help.
    #[error("payment backend rejected the request: {0}")]
    Fatal(String),
    /// 5xx/transport-class: worth retrying with backoff.
    #[error("payment backend temporarily unavailable: {0}")]
    Retriable(String),
}

/// Narrow interface to the payment backend. The engine approves and cancels;
/// the pull loop lists.
#[async_trait]
pub trait PaymentActions: Send + Sync {
    async fn list_queued(&self) -> Result<Vec<PayoutIntent>, PaymentActionError>;
    async fn approve(&self, payout_id: &str) -> Result<(), PaymentActionError>;
    async fn cancel(&self, payout_id: &str, reason: &str) -> Result<(), PaymentActionError>;
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// What a human approver needs to see about a held payout.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HeldSummary {
    pub payout_id: String,
    pub agent_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub vendor_name: Option<String>,
    pub vendor_url: Option<String>,
    pub detail: String,
}

/// Narrow interface to the human-notification channel.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, summary: &HeldSummary) -> Result<(), NotifyError>;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidIntent(#[from] IntentError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The orchestrator. Wired once at process start; depends only on the
/// capability interfaces of its collaborators.
pub struct GovernanceEngine {
    policies: Arc<dyn PolicyStore>,
    budget: Arc<dyn BudgetLedger>,
    idempotency: Arc<dyn IdempotencyGate>,
    audit: Arc<dyn AuditSink>,
    reputation: Arc<ReputationEvaluator>,
    anomaly: Arc<AnomalyScorer>,
    identity: Option<Arc<IdentityVerifier>>,
    payments: Arc<dyn PaymentActions>,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
    cycle_deadline: Duration,
}

impl GovernanceEngine {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        budget: Arc<dyn BudgetLedger>,
        idempotency: Arc<dyn IdempotencyGate>,
        audit: Arc<dyn AuditSink>,
        reputation: Arc<ReputationEvaluator>,
        anomaly: Arc<AnomalyScorer>,
        payments: Arc<dyn PaymentActions>,
    ) -> Self {
        Self {
            policies,
            budget,
            idempotency,
            audit,
            reputation,
            anomaly,
            identity: None,
            payments,
            notifier: None,
            cycle_deadline: DEFAULT_CYCLE_DEADLINE,
        }
    }

    pub fn with_identity(mut self, identity: Arc<IdentityVerifier>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_cycle_deadline(mut self, deadline: Duration) -> Self {
        self.cycle_deadline = deadline;
        self
    }

    /// Decide one payout intent. Exactly one audit record is committed before
    /// this returns; `Err` only when both audit paths are down.
    pub async fn decide(&self, intent: PayoutIntent) -> Result<DecisionOutcome, EngineError> {
        let started = Instant::now();
        intent.validate()?;

        // Step 1: at-most-once gate. Duplicates are audited as SKIPPED.
        match self.idempotency.claim(&intent.payout_id).await {
            Ok(Claim::FirstSeen) => {}
            Ok(Claim::AlreadySeen) => {
                let outcome = self.outcome(
                    &intent,
                    Decision::Skipped,
                    ReasonCode::IdempotentSkip,
                    "payout id already decided within the retention window".to_string(),
                    Vec::new(),
                    started,
                );
                self.commit(&intent, &outcome).await?;
                return Ok(outcome);
            }
            Err(err) => {
                let outcome = self.outcome(
                    &intent,
                    Decision::Rejected,
                    ReasonCode::InternalError,
                    format!("idempotency gate unavailable: {err}"),
                    Vec::new(),
                    started,
                );
                self.commit(&intent, &outcome).await?;
                self.dispatch_post_commit(&intent, &outcome, None).await;
                return Ok(outcome);
            }
        }

        // Steps 2-8 run under the cycle deadline. The reservation token is
        // tracked outside the governed future so a timeout can still roll
        // back, against the exact key reserved, whatever was reserved before
        // the cutoff.
        let reserved: Arc<Mutex<Option<ReservationToken>>> = Arc::new(Mutex::new(None));
        let governed = self.evaluate(&intent, Arc::clone(&reserved), started);
        let outcome = match tokio::time::timeout(self.cycle_deadline, governed).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.release(&reserved).await;
                self.outcome(
                    &intent,
                    Decision::Rejected,
                    ReasonCode::InternalError,
                    format!("governance cycle exceeded {:?}", self.cycle_deadline),
                    Vec::new(),
                    started,
                )
            }
        };

        // The terminal act: no decision leaves the engine un-audited.
        self.commit(&intent, &outcome).await?;
        let reservation = reserved.lock().take();
        self.dispatch_post_commit(&intent, &outcome, reservation).await;
        Ok(outcome)
    }

    /// Steps 2-8. Rejection paths after the reservation roll back before
    /// returning; APPROVED and HELD keep the reservation.
    async fn evaluate(
        &self,
        intent: &PayoutIntent,
        reserved: Arc<Mutex<Option<ReservationToken>>>,
        started: Instant,
    ) -> DecisionOutcome {
        // Step 2: policy.
        let policy = match self.policies.get(&intent.agent_id).await {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::NoPolicy,
                    format!("no policy configured for agent {}", intent.agent_id),
                    Vec::new(),
                    started,
                )
            }
            Err(err) => {
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::InternalError,
                    format!("policy store unavailable: {err}"),
                    Vec::new(),
                    started,
                )
            }
        };

        // Step 3: per-transaction cap, checked before the reservation so an
        // oversized request never inflates the counter. Strict `>`.
        if let Some(cap) = policy.per_txn_cap_minor {
            if intent.amount_minor > cap {
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::TxnLimitExceeded,
                    format!(
                        "amount {} exceeds per-transaction cap {}",
                        intent.amount_minor, cap
                    ),
                    Vec::new(),
                    started,
                );
            }
        }

        // Step 4: the atomic commit point.
        match self
            .budget
            .reserve(&intent.agent_id, intent.amount_minor, policy.daily_cap_minor)
            .await
        {
            Ok(Reservation::Reserved { token, .. }) => {
                *reserved.lock() = Some(token);
            }
            Ok(Reservation::Denied { current }) => {
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::LimitExceeded,
                    format!(
                        "daily cap {} would be exceeded: {} already reserved, {} requested",
                        policy.daily_cap_minor, current, intent.amount_minor
                    ),
                    Vec::new(),
                    started,
                );
            }
            Err(err) => {
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::InternalError,
                    format!("budget ledger unavailable: {err}"),
                    Vec::new(),
                    started,
                );
            }
        }

        let host = intent.vendor_url.as_deref().and_then(vendor_host);

        // Step 5: blocklist.
        if let Some(host) = &host {
            if policy.is_domain_blocked(host) {
                self.release(&reserved).await;
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::DomainBlocked,
                    format!("vendor domain {host} is blocked"),
                    Vec::new(),
                    started,
                );
            }
        }

        // Step 6: allowlist. An allowlist-restricted agent with no resolvable
        // vendor domain fails closed.
        if !policy.allowed_domains.is_empty() {
            match &host {
                Some(host) if policy.is_domain_allowed(host) => {}
                Some(host) => {
                    self.release(&reserved).await;
                    return self.outcome(
                        intent,
                        Decision::Rejected,
                        ReasonCode::DomainBlocked,
                        format!("vendor domain {host} is not on the allowlist"),
                        Vec::new(),
                        started,
                    );
                }
                None => {
                    self.release(&reserved).await;
                    return self.outcome(
                        intent,
                        Decision::Rejected,
                        ReasonCode::DomainBlocked,
                        "agent is allowlist-restricted and the intent carries no vendor domain"
                            .to_string(),
                        Vec::new(),
                        started,
                    );
                }
            }
        }

        // Step 7: vendor reputation, fail-closed.
        if let Some(url) = intent.vendor_url.as_deref() {
            let verdict = self.reputation.evaluate(url).await;
            if !verdict.safe {
                self.release(&reserved).await;
                let detail = if verdict.degraded {
                    "vendor reputation could not be established (threat intel degraded)"
                } else {
                    "vendor failed reputation screening"
                };
                return self.outcome(
                    intent,
                    Decision::Rejected,
                    ReasonCode::RiskHigh,
                    detail.to_string(),
                    verdict.threat_tags,
                    started,
                );
            }
        }

        // Advisory enrichment. Annotates the audit detail, never gates.
        let mut notes = Vec::new();
        let assessment = self
            .anomaly
            .score(
                &intent.agent_id,
                intent.amount_minor,
                intent.received_at,
                intent.vendor_url.as_deref(),
            )
            .await;
        if assessment.model_trained {
            notes.push(format!(
                "risk_score={:.2}{}",
                assessment.risk_score,
                if assessment.anomalous { " (anomalous)" } else { "" }
            ));
        }
        if let (Some(identity), Some(name)) = (&self.identity, intent.vendor_name.as_deref()) {
            let report = identity.verify(name).await;
            if report.verified {
                notes.push(format!(
                    "vendor identity verified: {}",
                    report.legal_name.unwrap_or_default()
                ));
            }
        }
        let annotate = |base: String| {
            if notes.is_empty() {
                base
            } else {
                format!("{}; {}", base, notes.join("; "))
            }
        };

        // Step 8: human approval threshold, inclusive. The reservation stays
        // until a human resolves the hold.
        if let Some(threshold) = policy.approval_threshold_minor {
            if intent.amount_minor >= threshold {
                return self.outcome(
                    intent,
                    Decision::Held,
                    ReasonCode::ApprovalRequired,
                    annotate(format!(
                        "amount {} meets approval threshold {}",
                        intent.amount_minor, threshold
                    )),
                    Vec::new(),
                    started,
                );
            }
        }

        self.outcome(
            intent,
            Decision::Approved,
            ReasonCode::PolicyOk,
            annotate("within policy".to_string()),
            Vec::new(),
            started,
        )
    }

    fn outcome(
        &self,
        intent: &PayoutIntent,
        decision: Decision,
        reason: ReasonCode,
        detail: String,
        threat_tags: Vec<String>,
        started: Instant,
    ) -> DecisionOutcome {
        DecisionOutcome {
            payout_id: intent.payout_id.clone(),
            decision,
            reason,
            detail,
            threat_tags,
            processing_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn commit(
        &self,
        intent: &PayoutIntent,
        outcome: &DecisionOutcome,
    ) -> Result<(), EngineError> {
        let record = AuditRecord::from_outcome(intent, outcome);
        self.audit.commit(&record).await?;
        METRICS.record_decision(outcome.decision, outcome.processing_ms);
        tracing::info!(
            payout_id = %intent.payout_id,
            agent_id = %intent.agent_id,
            amount_minor = intent.amount_minor,
            decision = outcome.decision.as_str(),
            reason = outcome.reason.as_str(),
            latency_ms = outcome.processing_ms,
            "governance decision committed"
        );
        Ok(())
    }

    /// Post-commit action coupling. Failures here never rewrite the audit
    /// trail; an APPROVED payout whose backend approval fails gets a
    /// compensating rollback and a compensating audit entry instead.
    /// `reservation` is the still-held token for APPROVED and HELD outcomes.
    async fn dispatch_post_commit(
        &self,
        intent: &PayoutIntent,
        outcome: &DecisionOutcome,
        reservation: Option<ReservationToken>,
    ) {
        match outcome.decision {
            Decision::Approved => {
                if let Err(err) = self.payments.approve(&intent.payout_id).await {
                    METRICS.record_payment_action_failure();
                    tracing::error!(
                        payout_id = %intent.payout_id,
                        error = %err,
                        "payment approval failed after APPROVED commit, rolling back reservation"
                    );
                    match &reservation {
                        Some(token) => self.rollback_quietly(token).await,
                        None => tracing::error!(
                            payout_id = %intent.payout_id,
                            "no reservation token for compensating rollback"
                        ),
                    }
                    let compensating = DecisionOutcome {
                        payout_id: intent.payout_id.clone(),
                        decision: Decision::Rejected,
                        reason: ReasonCode::InternalError,
                        detail: format!(
                            "compensating entry: payment approval failed after APPROVED commit: {err}"
                        ),
                        threat_tags: Vec::new(),
                        processing_ms: outcome.processing_ms,
                    };
                    let record = AuditRecord::from_outcome(intent, &compensating);
                    if let Err(audit_err) = self.audit.commit(&record).await {
                        tracing::error!(
                            payout_id = %intent.payout_id,
                            error = %audit_err,
                            "failed to write compensating audit entry"
                        );
                    }
                }
            }
            Decision::Rejected => {
                if let Err(err) = self
                    .payments
                    .cancel(&intent.payout_id, outcome.reason.as_str())
                    .await
                {
                    METRICS.record_payment_action_failure();
                    tracing::warn!(
                        payout_id = %intent.payout_id,
                        error = %err,
                        "payment cancel failed after REJECTED commit"
                    );
                }
            }
            Decision::Held => {
                let Some(notifier) = &self.notifier else {
                    tracing::warn!(
                        payout_id = %intent.payout_id,
                        "payout held but no approval notifier is configured"
                    );
                    return;
                };
                let summary = HeldSummary {
                    payout_id: intent.payout_id.clone(),
                    agent_id: intent.agent_id.clone(),
                    amount_minor: intent.amount_minor,
                    currency: intent.currency.clone(),
                    vendor_name: intent.vendor_name.clone(),
                    vendor_url: intent.vendor_url.clone(),
                    detail: outcome.detail.clone(),
                };
                if let Err(err) = notifier.notify(&summary).await {
                    METRICS.record_notification_failure();
                    tracing::warn!(
                        payout_id = %intent.payout_id,
                        error = %err,
                        "approval notification failed"
                    );
                }
            }
            Decision::Skipped => {}
        }
    }

    async fn release(&self, reserved: &Mutex<Option<ReservationToken>>) {
        let token = reserved.lock().take();
        if let Some(token) = token {
            self.rollback_quietly(&token).await;
        }
    }

    async fn rollback_quietly(&self, token: &ReservationToken) {
        if let Err(err) = self.budget.rollback(token).await {
            tracing::error!(
                key = %token.key(),
                amount = token.amount(),
                error = %err,
                "budget rollback failed; counter overstates reserved spend until expiry"
            );
        }
    }

    /// Budget snapshot for the admin surface.
    pub async fn budget_view(&self, agent_id: &str) -> Result<Option<BudgetView>, EngineError> {
        let Some(policy) = self.policies.get(agent_id).await? else {
            return Ok(None);
        };
        let spent = self.budget.current(agent_id).await?;
        Ok(Some(BudgetView {
            agent_id: agent_id.to_string(),
            daily_cap_minor: policy.daily_cap_minor,
            spent_minor: spent,
            remaining_minor: (policy.daily_cap_minor - spent).max(0),
        }))
    }
}
