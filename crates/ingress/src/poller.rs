//! Pull-mode intake: a bounded background poll of the payment backend.
//!
//! Each cycle lists payouts in the queued state and feeds them through the
//! engine; the shared idempotency gate makes push and pull collide safely on
//! the same payout id. Retriable backend failures back off exponentially
//! with jitter; fatal failures skip the cycle without escalating. The loop
//! observes shutdown between iterations and during every sleep.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use payguard_gate::metrics::METRICS;
use payguard_gate::{GovernanceEngine, PaymentActionError, PaymentActions};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// The background pull loop.
pub struct PollLoop {
    engine: Arc<GovernanceEngine>,
    payments: Arc<dyn PaymentActions>,
    interval: Duration,
    inflight: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl PollLoop {
    pub fn new(
        engine: Arc<GovernanceEngine>,
        payments: Arc<dyn PaymentActions>,
        interval: Duration,
        inflight: Arc<Semaphore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            payments,
            interval,
            inflight,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "payment poll loop started"
        );
        let mut consecutive_failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let pulled = self.payments.list_queued().await;
            match pulled {
                Ok(intents) => {
                    consecutive_failures = 0;
                    if !intents.is_empty() {
                        tracing::debug!(count = intents.len(), "queued payouts pulled");
                    }
                    for intent in intents {
                        // Backpressure: waiting here is the pull-side analog
                        // of the webhook's 503.
                        let Ok(permit) = Arc::clone(&self.inflight).acquire_owned().await else {
                            return;
                        };
                        let result = self.engine.decide(intent).await;
                        drop(permit);
                        if let Err(err) = result {
                            tracing::error!(error = %err, "poll-derived cycle could not commit");
                        }
                    }
                    if self.sleep_interrupted(self.interval).await {
                        break;
                    }
                }
                Err(PaymentActionError::Fatal(err)) => {
                    METRICS.record_poll_failure();
                    consecutive_failures = 0;
                    tracing::error!(error = %err, "poll rejected by payment backend, skipping cycle");
                    if self.sleep_interrupted(self.interval).await {
                        break;
                    }
                }
                Err(PaymentActionError::Retriable(err)) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    METRICS.record_poll_failure();
                    let delay = backoff_with_jitter(self.interval, consecutive_failures);
                    tracing::warn!(
                        error = %err,
                        consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "poll failed, backing off"
                    );
                    if self.sleep_interrupted(delay).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("payment poll loop stopped");
    }

    /// Sleep that wakes early on shutdown. Returns true when shut down.
    async fn sleep_interrupted(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
        }
    }
}

/// Exponential backoff with proportional jitter, capped at five minutes.
fn backoff_with_jitter(base: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(6);
    let scaled = base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(MAX_BACKOFF);
    let jitter_ceiling_ms = (scaled.as_millis() as u64) / 4;
    let jitter_ms = if jitter_ceiling_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_ceiling_ms)
    };
    scaled + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use payguard_gate::{
        MemoryAuditSink, MemoryPolicyStore, PayoutIntent,
    };
    use payguard_ledger::{MemoryBudgetLedger, MemoryIdempotencyGate, MemoryVerdictCache};
    use payguard_sentinel::{
        AnomalyScorer, BreakerConfig, CircuitBreaker, FeedError, ReputationEvaluator, ThreatFeed,
        ThreatMatch,
    };

    struct EmptyFeed;

    #[async_trait]
    impl ThreatFeed for EmptyFeed {
        async fn lookup(&self, _url: &str) -> Result<Vec<ThreatMatch>, FeedError> {
            Ok(vec![])
        }
    }

    struct IdlePayments;

    #[async_trait]
    impl PaymentActions for IdlePayments {
        async fn list_queued(&self) -> Result<Vec<PayoutIntent>, PaymentActionError> {
            Ok(vec![])
        }
        async fn approve(&self, _payout_id: &str) -> Result<(), PaymentActionError> {
            Ok(())
        }
        async fn cancel(&self, _payout_id: &str, _reason: &str) -> Result<(), PaymentActionError> {
            Ok(())
        }
    }

    fn engine(payments: Arc<dyn PaymentActions>) -> Arc<GovernanceEngine> {
        Arc::new(GovernanceEngine::new(
            Arc::new(MemoryPolicyStore::new()),
            Arc::new(MemoryBudgetLedger::new()),
            Arc::new(MemoryIdempotencyGate::new()),
            Arc::new(MemoryAuditSink::new()),
            Arc::new(ReputationEvaluator::new(
                Arc::new(EmptyFeed),
                Arc::new(MemoryVerdictCache::new()),
                CircuitBreaker::new("reputation", BreakerConfig::default()),
            )),
            Arc::new(AnomalyScorer::new()),
            payments,
        ))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(30);
        let first = backoff_with_jitter(base, 1);
        assert!(first >= base && first <= base + base / 4);

        let third = backoff_with_jitter(base, 3);
        assert!(third >= Duration::from_secs(120));

        let huge = backoff_with_jitter(base, 40);
        assert!(huge <= MAX_BACKOFF + MAX_BACKOFF / 4);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown_during_sleep() {
        let payments: Arc<dyn PaymentActions> = Arc::new(IdlePayments);
        let (tx, rx) = watch::channel(false);
        let poll = PollLoop::new(
            engine(Arc::clone(&payments)),
            payments,
            Duration::from_secs(3600),
            Arc::new(Semaphore::new(4)),
            rx,
        );

        let handle = tokio::spawn(poll.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not observe shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn loop_never_starts_once_shut_down() {
        let payments: Arc<dyn PaymentActions> = Arc::new(IdlePayments);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let poll = PollLoop::new(
            engine(Arc::clone(&payments)),
            payments,
            Duration::from_secs(3600),
            Arc::new(Semaphore::new(4)),
            rx,
        );

        tokio::time::timeout(Duration::from_secs(1), poll.run())
            .await
            .expect("loop did not exit immediately");
    }
}
