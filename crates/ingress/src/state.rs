//! Process wiring.
//!
//! Every service handle is constructed exactly once in [`build`] and carried
//! in an explicit [`AppState`] value injected into handlers. No module-global
//! mutable state, no ambient environment reads past startup.

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use payguard_gate::{
    AuditSink, GovernanceEngine, PaymentActions, PolicyStore, SqlAuditSink, SqlPolicyStore,
};
use payguard_ledger::{
    RedisBudgetLedger, RedisIdempotencyGate, RedisSubstrate, RedisVerdictCache,
};
use payguard_sentinel::{
    AnomalyScorer, BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker,
    HttpIdentityDirectory, HttpThreatFeed, IdentityVerifier, ReputationEvaluator,
};

use crate::config::{Config, Secret};
use crate::notify::WebhookApprovalNotifier;
use crate::payments::PaymentClient;
use crate::poller::PollLoop;

/// Shared handler state. Cloning is cheap; everything inside is a handle.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GovernanceEngine>,
    pub policies: Arc<dyn PolicyStore>,
    pub audit: Arc<dyn AuditSink>,
    pub reputation: Arc<ReputationEvaluator>,
    pub identity: Option<Arc<IdentityVerifier>>,
    pub webhook_secret: Secret,
    pub inflight: Arc<Semaphore>,
    substrate: Option<RedisSubstrate>,
}

impl AppState {
    pub fn new(
        engine: Arc<GovernanceEngine>,
        policies: Arc<dyn PolicyStore>,
        audit: Arc<dyn AuditSink>,
        reputation: Arc<ReputationEvaluator>,
        identity: Option<Arc<IdentityVerifier>>,
        webhook_secret: Secret,
        max_in_flight: usize,
    ) -> Self {
        Self {
            engine,
            policies,
            audit,
            reputation,
            identity,
            webhook_secret,
            inflight: Arc::new(Semaphore::new(max_in_flight)),
            substrate: None,
        }
    }

    pub fn with_substrate(mut self, substrate: RedisSubstrate) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Component probes plus breaker snapshots for operators.
    pub async fn health(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        if let Some(substrate) = &self.substrate {
            let status = match substrate.ping().await {
                Ok(()) => ComponentStatus::Ok,
                Err(_) => ComponentStatus::Down,
            };
            components.insert("fast_kv".to_string(), status);
        }
        components.insert(
            "policy_store".to_string(),
            match self.policies.ping().await {
                Ok(()) => ComponentStatus::Ok,
                Err(_) => ComponentStatus::Down,
            },
        );
        components.insert(
            "audit_primary".to_string(),
            match self.audit.ping().await {
                Ok(()) => ComponentStatus::Ok,
                Err(_) => ComponentStatus::Down,
            },
        );

        let mut breakers = vec![self.reputation.breaker_snapshot()];
        if let Some(identity) = &self.identity {
            breakers.push(identity.breaker_snapshot());
        }
        for snapshot in &breakers {
            let status = match snapshot.state {
                BreakerState::Closed => ComponentStatus::Ok,
                BreakerState::HalfOpen => ComponentStatus::Degraded,
                BreakerState::Open => ComponentStatus::Down,
            };
            components.insert(format!("breaker_{}", snapshot.name), status);
        }

        HealthReport {
            components,
            breakers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub components: BTreeMap<String, ComponentStatus>,
    pub breakers: Vec<BreakerSnapshot>,
}

impl HealthReport {
    pub fn degraded(&self) -> bool {
        self.components
            .values()
            .any(|status| *status != ComponentStatus::Ok)
    }
}

/// Wire the whole process from configuration. Returns the handler state and
/// the (not yet spawned) pull loop.
pub async fn build(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(AppState, PollLoop)> {
    // Fast KV substrate.
    let substrate = RedisSubstrate::connect(&config.redis_url).await?;
    let budget = Arc::new(RedisBudgetLedger::new(substrate.clone()));
    let idempotency = Arc::new(RedisIdempotencyGate::new(substrate.clone()));
    let verdict_cache = Arc::new(RedisVerdictCache::new(substrate.clone()));

    // Durable store.
    let connect_options =
        SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_millis(250))
        .connect_with(connect_options)
        .await?;
    let policy_store = Arc::new(SqlPolicyStore::new(pool.clone()));
    policy_store.migrate().await?;
    let audit_sink = Arc::new(SqlAuditSink::new(pool, &config.audit_fallback_dir));
    audit_sink.migrate().await?;
    let policies: Arc<dyn PolicyStore> = policy_store;
    let audit: Arc<dyn AuditSink> = audit_sink;

    // External intelligence, one breaker per dependency.
    let breaker_config = BreakerConfig {
        failure_threshold: config.breaker_failure_threshold,
        reset_timeout: config.breaker_reset_timeout,
    };
    let feed = Arc::new(HttpThreatFeed::new(
        &config.threat_intel_url,
        config.threat_intel_api_key.expose(),
    )?);
    let reputation = Arc::new(ReputationEvaluator::new(
        feed,
        verdict_cache,
        CircuitBreaker::new("reputation", breaker_config.clone()),
    ));
    let identity = match (&config.identity_api_url, &config.identity_api_key) {
        (Some(url), Some(key)) => {
            let directory = Arc::new(HttpIdentityDirectory::new(url, key.expose())?);
            Some(Arc::new(IdentityVerifier::new(
                directory,
                CircuitBreaker::new("identity", breaker_config),
            )))
        }
        _ => None,
    };

    // Payment backend.
    let payments: Arc<dyn PaymentActions> = Arc::new(PaymentClient::new(
        &config.payment_api_url,
        config.payment_api_key.clone(),
    )?);

    let mut engine = GovernanceEngine::new(
        Arc::clone(&policies),
        budget,
        idempotency,
        Arc::clone(&audit),
        Arc::clone(&reputation),
        Arc::new(AnomalyScorer::new()),
        Arc::clone(&payments),
    )
    .with_cycle_deadline(config.cycle_deadline);
    if let Some(identity) = &identity {
        engine = engine.with_identity(Arc::clone(identity));
    }
    if let Some(url) = &config.notification_url {
        let mut notifier = WebhookApprovalNotifier::new(url)?;
        if let Some(secondary) = &config.notification_fallback_url {
            notifier = notifier.with_secondary(secondary);
        }
        engine = engine.with_notifier(Arc::new(notifier));
    }
    let engine = Arc::new(engine);

    let state = AppState::new(
        Arc::clone(&engine),
        policies,
        audit,
        reputation,
        identity,
        config.webhook_secret.clone(),
        config.max_in_flight,
    )
    .with_substrate(substrate);

    let poll = PollLoop::new(
        engine,
        payments,
        config.poll_interval,
        Arc::clone(&state.inflight),
        shutdown,
    );

    Ok((state, poll))
}
