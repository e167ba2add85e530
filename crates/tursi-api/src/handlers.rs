//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.
//! Errors are rendered as `{ "error": <message>, "kind": <classification> }`.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use tursi_state::*;

use crate::ApiState;

const REQUIRED_FIELDS: [&str; 3] = ["model_name", "host", "port"];

fn error_response(msg: &str, kind: &str, status: StatusCode) -> Response {
    (status, Json(json!({ "error": msg, "kind": kind }))).into_response()
}

fn bad_request(msg: &str) -> Response {
    error_response(msg, "bad_request", StatusCode::BAD_REQUEST)
}

fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Constraint(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if e.is_transient() {
        warn!(error = %e, "store failure while serving request");
    }
    error_response(&e.to_string(), e.kind(), status)
}

fn not_found(id: DeploymentId) -> Response {
    error_response(&format!("deployment {id} not found"), "not_found", StatusCode::NOT_FOUND)
}

/// `?limit=N` on the log and metric listings.
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ── Health ─────────────────────────────────────────────────────

/// GET /api/v1/health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/models
pub async fn list_models(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_active() {
        Ok(deployments) => Json(json!({ "deployments": deployments })).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/models/{id}
pub async fn get_model(
    State(state): State<ApiState>,
    id: Result<Path<DeploymentId>, PathRejection>,
) -> impl IntoResponse {
    let Ok(Path(id)) = id else {
        return bad_request("deployment id must be a positive integer");
    };
    match state.store.get(id) {
        Ok(Some(deployment)) => Json(deployment).into_response(),
        Ok(None) => not_found(id),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/models
pub async fn create_model(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    let new = match parse_new_deployment(&body) {
        Ok(new) => new,
        Err(msg) => return bad_request(&msg),
    };

    match state.store.create(&new) {
        Ok(id) => {
            info!(
                deployment_id = id,
                model = %new.model_name,
                host = %new.host,
                port = new.port,
                "deployment requested"
            );
            (
                StatusCode::ACCEPTED,
                Json(json!({ "deployment_id": id, "status": DeploymentStatus::Pending })),
            )
                .into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/models/{id}
pub async fn stop_model(
    State(state): State<ApiState>,
    id: Result<Path<DeploymentId>, PathRejection>,
) -> impl IntoResponse {
    let Ok(Path(id)) = id else {
        return bad_request("deployment id must be a positive integer");
    };
    match state.store.request_stop(id) {
        Ok(deployment) => {
            info!(deployment_id = id, "stop requested");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "deployment_id": id, "status": deployment.status })),
            )
                .into_response()
        }
        Err(e) => state_error(&e),
    }
}

// ── Logs & metrics ─────────────────────────────────────────────

/// GET /api/v1/models/{id}/logs
pub async fn get_logs(
    State(state): State<ApiState>,
    id: Result<Path<DeploymentId>, PathRejection>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> impl IntoResponse {
    let (id, limit) = match (id, query) {
        (Ok(Path(id)), Ok(Query(q))) => (id, q.limit.unwrap_or(DEFAULT_LOG_LIMIT)),
        (Err(_), _) => return bad_request("deployment id must be a positive integer"),
        (_, Err(_)) => return bad_request("limit must be a non-negative integer"),
    };
    match state.store.get(id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(id),
        Err(e) => return state_error(&e),
    }
    match state.store.list_logs(id, limit) {
        Ok(logs) => Json(json!({ "logs": logs })).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/models/{id}/metrics
pub async fn get_metrics(
    State(state): State<ApiState>,
    id: Result<Path<DeploymentId>, PathRejection>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> impl IntoResponse {
    let (id, limit) = match (id, query) {
        (Ok(Path(id)), Ok(Query(q))) => (id, q.limit.unwrap_or(DEFAULT_METRIC_LIMIT)),
        (Err(_), _) => return bad_request("deployment id must be a positive integer"),
        (_, Err(_)) => return bad_request("limit must be a non-negative integer"),
    };
    match state.store.get(id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(id),
        Err(e) => return state_error(&e),
    }
    match state.store.list_metrics(id, limit) {
        Ok(metrics) => Json(json!({ "metrics": metrics })).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Request parsing ────────────────────────────────────────────

/// Validate a create body. Missing fields are reported together.
fn parse_new_deployment(body: &Value) -> Result<NewDeployment, String> {
    let Some(fields) = body.as_object() else {
        return Err("request body must be a JSON object".to_string());
    };

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| fields.get(*f).is_none_or(Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing required fields: {}", missing.join(", ")));
    }

    let model_name = match fields["model_name"].as_str() {
        Some(name) if !name.trim().is_empty() => name,
        _ => return Err("model_name must be a non-empty string".to_string()),
    };
    let host = match fields["host"].as_str() {
        Some(host) if !host.trim().is_empty() => host,
        _ => return Err("host must be a non-empty string".to_string()),
    };
    let port = fields["port"]
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| "port must be an integer between 1 and 65535".to_string())?;
    let config = match fields.get("config") {
        None | Some(Value::Null) => json!({}),
        Some(config) => config.clone(),
    };

    Ok(NewDeployment::new(model_name, host, port, config))
}
