//! The HTTP surface end to end: signed webhooks in, decisions and admin
//! queries out, against in-memory collaborators.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};

use payguard_gate::{
    ApprovalNotifier, GovernanceEngine, HeldSummary, MemoryAuditSink, MemoryPolicyStore,
    NotifyError, PaymentActionError, PaymentActions, PayoutIntent, PolicyStore,
};
use payguard_ingress::webhook::{sign, SIGNATURE_HEADER};
use payguard_ingress::{routes, AppState, Secret};
use payguard_ledger::{MemoryBudgetLedger, MemoryIdempotencyGate, MemoryVerdictCache};
use payguard_sentinel::{
    AnomalyScorer, BreakerConfig, CircuitBreaker, FeedError, ReputationEvaluator, ThreatFeed,
    ThreatMatch,
};

const SECRET: &str = "whsec_test";

struct SafeFeed;

#[async_trait]
impl ThreatFeed for SafeFeed {
    async fn lookup(&self, url: &str) -> Result<Vec<ThreatMatch>, FeedError> {
        if url.contains("evil") {
            Ok(vec![ThreatMatch {
                threat_type: "SOCIAL_ENGINEERING".to_string(),
                cache_ttl: Some(Duration::from_secs(60)),
            }])
        } else {
            Ok(vec![])
        }
    }
}

struct OkPayments;

#[async_trait]
impl PaymentActions for OkPayments {
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

struct NullNotifier;

#[async_trait]
impl ApprovalNotifier for NullNotifier {
    async fn notify(&self, _summary: &HeldSummary) -> Result<(), NotifyError> {
        Ok(())
    }
}

fn test_state() -> AppState {
    let policies = Arc::new(MemoryPolicyStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let reputation = Arc::new(ReputationEvaluator::new(
        Arc::new(SafeFeed),
        Arc::new(MemoryVerdictCache::new()),
        CircuitBreaker::new("reputation", BreakerConfig::default()),
    ));
    let engine = Arc::new(
        GovernanceEngine::new(
            Arc::clone(&policies) as Arc<dyn PolicyStore>,
            Arc::new(MemoryBudgetLedger::new()),
            Arc::new(MemoryIdempotencyGate::new()),
            Arc::clone(&audit) as _,
            Arc::clone(&reputation),
            Arc::new(AnomalyScorer::new()),
            Arc::new(OkPayments),
        )
        .with_notifier(Arc::new(NullNotifier)),
    );

    AppState::new(
        engine,
        policies,
        audit,
        reputation,
        None,
        Secret::new(SECRET),
        16,
    )
}

fn queued_event(payout_id: &str, amount: i64) -> Vec<u8> {
    serde_json::json!({
        "event_type": "payout.queued",
        "payout": {
            "id": payout_id,
            "amount": amount,
            "currency": "USD",
            "metadata": { "agent_id": "agent-1", "vendor_url": "https://safe.example" }
        }
    })
    .to_string()
    .into_bytes()
}

fn signed_webhook(body: Vec<u8>) -> Request<Body> {
    let signature = sign(SECRET, &body);
    Request::builder()
        .method("POST")
        .uri("/hooks/payments")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn put_policy(app: &axum::Router, body: serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/policies")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

fn standard_policy() -> serde_json::Value {
    serde_json::json!({
        "agent_id": "agent-1",
        "daily_cap_minor": 500_000,
        "per_txn_cap_minor": 100_000,
        "approval_threshold_minor": 50_000
    })
}

#[tokio::test]
async fn signed_webhook_is_decided() {
    let app = routes::router(test_state());
    put_policy(&app, standard_policy()).await;

    let response = app
        .clone()
        .oneshot(signed_webhook(queued_event("po_1", 25_000)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["decision"], "APPROVED");
    assert_eq!(body["reason"], "POLICY_OK");
}

#[tokio::test]
async fn bad_signature_is_401_and_never_reaches_the_engine() {
    let app = routes::router(test_state());

    let body = queued_event("po_2", 25_000);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hooks/payments")
                .header(SIGNATURE_HEADER, "deadbeef")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Nothing audited: the intent never entered the pipeline.
    let audit = app
        .clone()
        .oneshot(Request::builder().uri("/audit").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let records = json_body(audit).await;
    assert_eq!(records.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn duplicate_webhook_comes_back_skipped() {
    let app = routes::router(test_state());
    put_policy(&app, standard_policy()).await;

    let first = app
        .clone()
        .oneshot(signed_webhook(queued_event("po_3", 25_000)))
        .await
        .unwrap();
    assert_eq!(json_body(first).await["decision"], "APPROVED");

    let replay = app
        .clone()
        .oneshot(signed_webhook(queued_event("po_3", 25_000)))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    let body = json_body(replay).await;
    assert_eq!(body["decision"], "SKIPPED");
    assert_eq!(body["reason"], "IDEMPOTENT_SKIP");
}

#[tokio::test]
async fn non_queued_events_are_ignored() {
    let app = routes::router(test_state());

    let body = serde_json::json!({
        "event_type": "payout.settled",
        "payout": {
            "id": "po_4", "amount": 10, "currency": "USD",
            "metadata": { "agent_id": "agent-1" }
        }
    })
    .to_string()
    .into_bytes();

    let response = app.clone().oneshot(signed_webhook(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ignored");
}

#[tokio::test]
async fn malformed_body_is_400() {
    let app = routes::router(test_state());

    let response = app
        .clone()
        .oneshot(signed_webhook(b"{\"event_type\":\"payout.queued\"}".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submit_intent_and_read_budget() {
    let app = routes::router(test_state());
    put_policy(&app, standard_policy()).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/intents")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "payout_id": "po_5",
                        "agent_id": "agent-1",
                        "amount_minor": 40_000,
                        "currency": "USD"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["decision"], "APPROVED");

    let budget = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/budgets/agent-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(budget.status(), StatusCode::OK);
    let view = json_body(budget).await;
    assert_eq!(view["spent_minor"], 40_000);
    assert_eq!(view["remaining_minor"], 460_000);
}

#[tokio::test]
async fn budget_for_unknown_agent_is_404() {
    let app = routes::router(test_state());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/budgets/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_policy_is_400() {
    let app = routes::router(test_state());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/policies")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "agent_id": "agent-1",
                        "daily_cap_minor": 100,
                        "per_txn_cap_minor": 200
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn audit_filter_by_decision() {
    let app = routes::router(test_state());
    put_policy(&app, standard_policy()).await;

    app.clone()
        .oneshot(signed_webhook(queued_event("po_6", 25_000)))
        .await
        .unwrap();
    // Second distinct payout against the txn cap.
    app.clone()
        .oneshot(signed_webhook(queued_event("po_7", 120_000)))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/audit?decision=REJECTED")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let records = json_body(response).await;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["payout_id"], "po_7");
    assert_eq!(records[0]["reason"], "TXN_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let app = routes::router(test_state());

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let report = json_body(health).await;
    assert!(report["components"]["policy_store"] == "ok");

    let metrics = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let bytes = to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("payguard_decisions_total"));
}
