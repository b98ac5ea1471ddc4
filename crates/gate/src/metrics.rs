//! Production metrics for the governance pipeline.
//!
//! Exports Prometheus-compatible counters for decisions, audit fallback
//! writes, post-commit payment failures, notification failures, and poll
//! cycle failures, plus a bounded decision-latency sample.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Decision;

/// Global metrics registry.
pub static METRICS: once_cell::sync::Lazy<GovernanceMetrics> =
    once_cell::sync::Lazy::new(GovernanceMetrics::new);

const LATENCY_SAMPLES: usize = 1000;

/// Governance pipeline metrics exporter.
pub struct GovernanceMetrics {
    decisions_approved: AtomicU64,
    decisions_rejected: AtomicU64,
    decisions_held: AtomicU64,
    decisions_skipped: AtomicU64,

    audit_fallback_writes: AtomicU64,
    payment_action_failures: AtomicU64,
    notification_failures: AtomicU64,
    poll_cycle_failures: AtomicU64,
    signature_rejections: AtomicU64,

    decision_latency_ms: RwLock<Vec<u64>>,
}

impl GovernanceMetrics {
    pub fn new() -> Self {
        Self {
            decisions_approved: AtomicU64::new(0),
            decisions_rejected: AtomicU64::new(0),
            decisions_held: AtomicU64::new(0),
            decisions_skipped: AtomicU64::new(0),
            audit_fallback_writes: AtomicU64::new(0),
            payment_action_failures: AtomicU64::new(0),
            notification_failures: AtomicU64::new(0),
            poll_cycle_failures: AtomicU64::new(0),
            signature_rejections: AtomicU64::new(0),
            decision_latency_ms: RwLock::new(Vec::new()),
        }
    }

    pub fn record_decision(&self, decision: Decision, latency_ms: u64) {
        let counter = match decision {
            Decision::Approved => &self.decisions_approved,
            Decision::Rejected => &self.decisions_rejected,
            Decision::Held => &self.decisions_held,
            Decision::Skipped => &self.decisions_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut latencies = self.decision_latency_ms.write();
        latencies.push(latency_ms);
        if latencies.len() > LATENCY_SAMPLES {
            latencies.remove(0);
        }
    }

    pub fn record_audit_fallback(&self) {
        self.audit_fallback_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payment_action_failure(&self) {
        self.payment_action_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_failure(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.poll_cycle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signature_rejection(&self) {
        self.signature_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(
            "# HELP payguard_decisions_total Governance decisions by outcome\n\
             # TYPE payguard_decisions_total counter\n",
        );
        for (label, counter) in [
            ("approved", &self.decisions_approved),
            ("rejected", &self.decisions_rejected),
            ("held", &self.decisions_held),
            ("skipped", &self.decisions_skipped),
        ] {
            output.push_str(&format!(
                "payguard_decisions_total{{decision=\"{}\"}} {}\n",
                label,
                counter.load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        for (name, help, counter) in [
            (
                "payguard_audit_fallback_writes_total",
                "Audit records committed to the local fallback path",
                &self.audit_fallback_writes,
            ),
            (
                "payguard_payment_action_failures_total",
                "Post-commit payment-backend action failures",
                &self.payment_action_failures,
            ),
            (
                "payguard_notification_failures_total",
                "Approval notification delivery failures",
                &self.notification_failures,
            ),
            (
                "payguard_poll_cycle_failures_total",
                "Payment-backend poll cycles that failed",
                &self.poll_cycle_failures,
            ),
            (
                "payguard_signature_rejections_total",
                "Webhook requests rejected for a bad signature",
                &self.signature_rejections,
            ),
        ] {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        let latencies = self.decision_latency_ms.read();
        if !latencies.is_empty() {
            let avg = latencies.iter().sum::<u64>() / latencies.len() as u64;
            let max = latencies.iter().max().copied().unwrap_or(0);
            output.push_str(&format!(
                "# HELP payguard_decision_latency_ms Decision latency over recent samples\n\
                 # TYPE payguard_decision_latency_ms gauge\n\
                 payguard_decision_latency_ms{{stat=\"avg\"}} {avg}\n\
                 payguard_decision_latency_ms{{stat=\"max\"}} {max}\n"
            ));
        }

        output
    }

    /// Get summary statistics.
    pub fn summary(&self) -> MetricsSummary {
        let latencies = self.decision_latency_ms.read();
        MetricsSummary {
            approved: self.decisions_approved.load(Ordering::Relaxed),
            rejected: self.decisions_rejected.load(Ordering::Relaxed),
            held: self.decisions_held.load(Ordering::Relaxed),
            skipped: self.decisions_skipped.load(Ordering::Relaxed),
            audit_fallback_writes: self.audit_fallback_writes.load(Ordering::Relaxed),
            payment_action_failures: self.payment_action_failures.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            avg_latency_ms: if latencies.is_empty() {
                0
            } else {
                latencies.iter().sum::<u64>() / latencies.len() as u64
            },
        }
    }

    /// Reset all metrics (for testing).
    pub fn reset(&self) {
        self.decisions_approved.store(0, Ordering::Relaxed);
        self.decisions_rejected.store(0, Ordering::Relaxed);
        self.decisions_held.store(0, Ordering::Relaxed);
        self.decisions_skipped.store(0, Ordering::Relaxed);
        self.audit_fallback_writes.store(0, Ordering::Relaxed);
        self.payment_action_failures.store(0, Ordering::Relaxed);
        self.notification_failures.store(0, Ordering::Relaxed);
        self.poll_cycle_failures.store(0, Ordering::Relaxed);
        self.signature_rejections.store(0, Ordering::Relaxed);
        self.decision_latency_ms.write().clear();
    }
}

impl Default for GovernanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of governance metrics.
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub approved: u64,
    pub rejected: u64,
    pub held: u64,
    pub skipped: u64,
    pub audit_fallback_writes: u64,
    pub payment_action_failures: u64,
    pub notification_failures: u64,
    pub avg_latency_ms: u64,
}
