//! Guardian HTTP API
//!
//! Every decision endpoint answers with the same envelope. `ok=false` always
//! carries verdict `BLOCK`, so a caller that only looks at `verdict` still
//! fails closed.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::{Decision, Orchestrator};
use crate::error::Error;
use crate::guardian::approval::{ApprovalRequest, Tally, Vote};
use crate::guardian::summary::GuardianSummary;
use crate::guardian::types::VerdictKind;
use crate::shield::packet::ActionRequest;
use crate::shield::types::RiskLevel;

/// Machine-readable failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ApiError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Response envelope for preflight and postflight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    pub ok: bool,
    pub verdict: VerdictKind,
    pub guardian_risk_score: Option<f64>,
    pub guardian_risk_level: Option<RiskLevel>,
    pub reason: String,
    pub reasons: Vec<String>,
    pub correlation_id: Option<String>,
    pub rule_ids: Vec<String>,
    pub approval: Option<ApprovalRequest>,
    pub summary: Option<GuardianSummary>,
    pub error: Option<ApiError>,
}

impl DecisionEnvelope {
    fn from_decision(decision: Decision) -> Self {
        Self {
            ok: true,
            verdict: decision.verdict.kind,
            guardian_risk_score: Some(decision.risk_map.final_score),
            guardian_risk_level: Some(decision.risk_map.level),
            reason: decision.verdict.primary_reason().to_string(),
            reasons: decision.verdict.reasons,
            correlation_id: Some(decision.correlation_id),
            rule_ids: decision.verdict.rule_ids,
            approval: decision.approval,
            summary: Some(decision.summary),
            error: None,
        }
    }

    fn failure(error: ApiError, correlation_id: Option<String>) -> Self {
        Self {
            ok: false,
            verdict: VerdictKind::Block,
            guardian_risk_score: None,
            guardian_risk_level: None,
            reason: error.code.clone(),
            reasons: vec![error.code.clone()],
            correlation_id,
            rule_ids: Vec::new(),
            approval: None,
            summary: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostflightBody {
    pub request: ActionRequest,
    #[serde(default)]
    pub approval_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyQuery {
    pub wallet_id: Option<String>,
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteBody {
    pub guardian_id: String,
    pub vote: Vote,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Approval request plus its tally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub ok: bool,
    pub authorized: bool,
    pub tally: Tally,
    pub request: ApprovalRequest,
}

/// HTTP status for an engine error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidActionRequest(_) | Error::MissingScope(_) => StatusCode::BAD_REQUEST,
        Error::UnknownApprovalRequest(_) => StatusCode::NOT_FOUND,
        Error::RequestAlreadyTerminal { .. } => StatusCode::CONFLICT,
        Error::GuardianNotEligible { .. } => StatusCode::FORBIDDEN,
        Error::Config(_) | Error::ConfigInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(error: &Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        status_for(error),
        Json(serde_json::json!({
            "ok": false,
            "error": ApiError::from(error),
        })),
    )
}

fn bad_json(rejection: JsonRejection) -> (StatusCode, Json<DecisionEnvelope>) {
    let error = ApiError {
        code: "invalid_action_request".to_string(),
        message: rejection.body_text(),
    };
    (StatusCode::BAD_REQUEST, Json(DecisionEnvelope::failure(error, None)))
}

/// Build the router with all endpoints
pub fn build_router(engine: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/v0/tx/preflight", post(handle_preflight))
        .route("/v0/tx/postflight", post(handle_postflight))
        .route("/v0/policy/state", get(handle_policy_state))
        .route("/v0/policy/reload", post(handle_policy_reload))
        .route("/v0/approvals/{id}", get(handle_get_approval))
        .route("/v0/approvals/{id}/vote", post(handle_vote))
        .route("/health", get(handle_health))
        .with_state(engine)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(engine: Arc<Orchestrator>, bind: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "Guardian API listening");
    axum::serve(listener, build_router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// POST /v0/tx/preflight
async fn handle_preflight(
    State(engine): State<Arc<Orchestrator>>,
    body: Result<Json<ActionRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    let correlation_id = request.correlation_id.clone();

    match engine.evaluate(&request).await {
        Ok(decision) => (StatusCode::OK, Json(DecisionEnvelope::from_decision(decision))),
        Err(e) => (
            status_for(&e),
            Json(DecisionEnvelope::failure(ApiError::from(&e), correlation_id)),
        ),
    }
}

/// POST /v0/tx/postflight
async fn handle_postflight(
    State(engine): State<Arc<Orchestrator>>,
    body: Result<Json<PostflightBody>, JsonRejection>,
) -> impl IntoResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    let correlation_id = body.request.correlation_id.clone();

    match engine.postflight(&body.request, body.approval_id.as_deref()).await {
        Ok(decision) => (StatusCode::OK, Json(DecisionEnvelope::from_decision(decision))),
        Err(e) => (
            status_for(&e),
            Json(DecisionEnvelope::failure(ApiError::from(&e), correlation_id)),
        ),
    }
}

/// GET /v0/policy/state?wallet_id=&account_id=
async fn handle_policy_state(
    State(engine): State<Arc<Orchestrator>>,
    Query(query): Query<PolicyQuery>,
) -> impl IntoResponse {
    let Some(wallet_id) = query.wallet_id.filter(|w| !w.trim().is_empty()) else {
        return error_body(&Error::MissingScope("wallet_id"));
    };

    let rules = engine.policy().snapshot();
    let policy = rules.effective_policy(&wallet_id, query.account_id.as_deref());
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "ok": true,
            "policy": policy,
            "diagnostics": engine.policy().diagnostics(),
        })),
    )
}

/// POST /v0/policy/reload
async fn handle_policy_reload(State(engine): State<Arc<Orchestrator>>) -> impl IntoResponse {
    match engine.policy().reload() {
        Ok(rules) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "version": rules.version,
                "source": rules.source.to_string(),
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Policy reload rejected");
            let (status, Json(mut body)) = error_body(&e);
            body["version"] = serde_json::json!(engine.policy().snapshot().version);
            body["diagnostics"] = serde_json::json!(engine.policy().diagnostics());
            (status, Json(body))
        }
    }
}

/// GET /v0/approvals/{id}
async fn handle_get_approval(
    State(engine): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.approvals().get(&id) {
        Some(request) => approval_response(&engine, request),
        None => error_body(&Error::UnknownApprovalRequest(id)),
    }
}

/// POST /v0/approvals/{id}/vote
async fn handle_vote(
    State(engine): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    body: Result<Json<VoteBody>, JsonRejection>,
) -> impl IntoResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_body(&Error::InvalidActionRequest(rejection.body_text()));
        }
    };

    match engine
        .approvals()
        .apply_vote(&id, &body.guardian_id, body.vote, body.reason, Utc::now())
    {
        Ok(request) => approval_response(&engine, request),
        Err(e) => error_body(&e),
    }
}

fn approval_response(
    engine: &Orchestrator,
    request: ApprovalRequest,
) -> (StatusCode, Json<serde_json::Value>) {
    let response = ApprovalResponse {
        ok: true,
        authorized: engine.approvals().authorizes(&request.id),
        tally: request.tally(),
        request,
    };
    (StatusCode::OK, Json(serde_json::json!(response)))
}

/// GET /health
async fn handle_health(State(engine): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let mut health = serde_json::json!(engine.health());
    health["status"] = serde_json::json!("ok");
    Json(health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AuditSink;
    use crate::guardian::approval::ApprovalStore;
    use crate::guardian::rules::{PolicyStore, RuleSet};
    use crate::guardian::types::GuardianRule;
    use crate::shield::client::StaticSignalClient;
    use crate::shield::registry::SignalRegistry;
    use crate::shield::types::ActionKind;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let mut registry = SignalRegistry::new();
        for layer in ["sentinel", "dqsn", "adn", "qac", "adaptive"] {
            registry.register(Arc::new(StaticSignalClient::new(layer, 0.05)), 1.0);
        }
        let guardians = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        let rules = RuleSet::from_rules(
            "api-test",
            guardians.clone(),
            vec![
                GuardianRule::threshold("send-1000", ActionKind::Send, 1_000, 2, guardians),
                GuardianRule::block("no-burn", ActionKind::AssetBurn),
            ],
        )
        .unwrap();
        let engine = Orchestrator::new(
            registry,
            Arc::new(PolicyStore::new(rules)),
            Arc::new(ApprovalStore::new()),
            AuditSink::disabled(),
        );
        build_router(Arc::new(engine))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_preflight_allow() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/v0/tx/preflight",
            Some(json!({"wallet_id": "w1", "action": "send", "amount": 10, "correlation_id": "c-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["verdict"], "ALLOW");
        assert_eq!(body["guardian_risk_level"], "low");
        assert_eq!(body["correlation_id"], "c-1");
        assert_eq!(body["summary"]["schema_version"], "1");
    }

    #[tokio::test]
    async fn test_bad_requests_block() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/v0/tx/preflight",
            Some(json!({"wallet_id": "w1", "action": "teleport", "amount": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["verdict"], "BLOCK");
        assert_eq!(body["error"]["code"], "invalid_action_request");

        let (status, body) = call(&app, "POST", "/v0/tx/preflight", Some(json!({"amount": "lots"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["verdict"], "BLOCK");

        let (status, body) = call(
            &app,
            "POST",
            "/v0/tx/preflight",
            Some(json!({"wallet_id": " ", "action": "send", "amount": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "missing_scope");
    }

    #[tokio::test]
    async fn test_approval_flow() {
        let app = app();
        let send = json!({"wallet_id": "w1", "action": "send", "amount": 1500});
        let (_, body) = call(&app, "POST", "/v0/tx/preflight", Some(send.clone())).await;
        assert_eq!(body["verdict"], "REQUIRE_APPROVAL");
        let id = body["approval"]["id"].as_str().unwrap().to_string();

        let vote_uri = format!("/v0/approvals/{}/vote", id);
        let (status, body) = call(&app, "POST", &vote_uri, Some(json!({"guardian_id": "g1", "vote": "approve"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], false);
        assert_eq!(body["tally"]["approved"], 1);

        let (status, _) = call(&app, "POST", &vote_uri, Some(json!({"guardian_id": "eve", "vote": "approve"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = call(&app, "POST", &vote_uri, Some(json!({"guardian_id": "g2", "vote": "approve"}))).await;
        assert_eq!(body["authorized"], true);
        assert_eq!(body["request"]["status"], "APPROVED");

        let (status, body) = call(&app, "POST", &vote_uri, Some(json!({"guardian_id": "g3", "vote": "reject"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "request_already_terminal");

        let (_, body) = call(
            &app,
            "POST",
            "/v0/tx/postflight",
            Some(json!({"request": send, "approval_id": id})),
        )
        .await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["verdict"], "ALLOW");

        let (status, body) = call(&app, "GET", &format!("/v0/approvals/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["status"], "APPROVED");
    }

    #[tokio::test]
    async fn test_unknown_approval() {
        let app = app();
        let (status, body) = call(&app, "GET", "/v0/approvals/apr_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "unknown_approval_request");
    }

    #[tokio::test]
    async fn test_policy_state_and_reload() {
        let app = app();
        let (status, body) = call(&app, "GET", "/v0/policy/state?wallet_id=w1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["policy"]["version"], "api-test");
        assert_eq!(body["policy"]["actions"]["asset_burn"][0]["effect"], "BLOCK");

        let (status, _) = call(&app, "GET", "/v0/policy/state", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No rule file behind this store
        let (status, body) = call(&app, "POST", "/v0/policy/reload", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["version"], "api-test");
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rule_set_version"], "api-test");
        assert_eq!(body["layers"].as_array().unwrap().len(), 5);
    }
}
