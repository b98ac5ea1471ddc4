//! The HTTP surface: webhook intake plus the admin/query API.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use payguard_gate::metrics::METRICS;
use payguard_gate::{
    AgentPolicy, AuditFilter, AuditRecord, BudgetView, Decision, DecisionOutcome, PayoutIntent,
    PolicyError,
};

use crate::state::{AppState, HealthReport};
use crate::webhook;

const MAX_BODY_BYTES: usize = 256 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hooks/payments", post(webhook::handle_webhook))
        .route("/intents", post(submit_intent))
        .route("/budgets/{agent_id}", get(get_budget))
        .route("/audit", get(query_audit))
        .route("/policies", put(upsert_policy))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Uniform error body for the admin surface.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn not_found(message: impl ToString) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }

    fn unavailable(message: impl ToString) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.to_string(),
        }
    }

    fn internal(message: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SubmitIntentRequest {
    payout_id: String,
    agent_id: String,
    amount_minor: i64,
    currency: String,
    vendor_name: Option<String>,
    vendor_url: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// POST /intents
async fn submit_intent(
    State(state): State<AppState>,
    Json(request): Json<SubmitIntentRequest>,
) -> Result<Json<DecisionOutcome>, ApiError> {
    let mut intent = PayoutIntent::new(
        request.payout_id,
        request.agent_id,
        request.amount_minor,
        request.currency,
    );
    intent.vendor_name = request.vendor_name;
    intent.vendor_url = request.vendor_url;
    intent.annotations = request.annotations;
    intent.validate().map_err(ApiError::bad_request)?;

    let permit = Arc::clone(&state.inflight)
        .try_acquire_owned()
        .map_err(|_| ApiError::unavailable("at capacity, retry later"))?;

    // Detached, like the webhook path: a dropped request must not abandon
    // the cycle between reservation and commit.
    let engine = Arc::clone(&state.engine);
    let outcome = tokio::spawn(async move {
        let _permit = permit;
        engine.decide(intent).await
    })
    .await
    .map_err(ApiError::internal)?
    .map_err(ApiError::internal)?;
    Ok(Json(outcome))
}

/// GET /budgets/{agent_id}
async fn get_budget(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<BudgetView>, ApiError> {
    let view = state
        .engine
        .budget_view(&agent_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("no policy for agent {agent_id}")))?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct AuditQueryParams {
    agent_id: Option<String>,
    payout_id: Option<String>,
    decision: Option<String>,
    limit: Option<u32>,
}

/// GET /audit
async fn query_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let decision = match params.decision.as_deref() {
        None => None,
        Some(raw) => Some(
            Decision::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown decision {raw:?}")))?,
        ),
    };
    let filter = AuditFilter {
        agent_id: params.agent_id,
        payout_id: params.payout_id,
        decision,
        limit: params.limit,
    };
    let records = state
        .audit
        .query(&filter)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
struct PolicyRequest {
    agent_id: String,
    daily_cap_minor: i64,
    per_txn_cap_minor: Option<i64>,
    approval_threshold_minor: Option<i64>,
    #[serde(default)]
    allowed_domains: Vec<String>,
    #[serde(default)]
    blocked_domains: Vec<String>,
}

/// PUT /policies
async fn upsert_policy(
    State(state): State<AppState>,
    Json(request): Json<PolicyRequest>,
) -> Result<StatusCode, ApiError> {
    let mut policy = AgentPolicy::new(request.agent_id, request.daily_cap_minor)
        .with_allowed_domains(request.allowed_domains)
        .with_blocked_domains(request.blocked_domains);
    policy.per_txn_cap_minor = request.per_txn_cap_minor;
    policy.approval_threshold_minor = request.approval_threshold_minor;

    match state.policies.upsert(policy).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(PolicyError::Invalid(violation)) => Err(ApiError::bad_request(violation)),
        Err(err) => Err(ApiError::internal(err)),
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health().await)
}

/// GET /metrics
async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.export_prometheus(),
    )
}
