//! HTTP gateway exposing orchestration start and status over axum.
//!
//! `POST /orchestrations/{name}` starts an instance (202 with a status query
//! URL, 409 when the id is already active) and
//! `GET /orchestrations/{instance_id}` reports derived status. Handler faults
//! map to structured error responses; nothing here can crash the process.
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::runtime::{OrchestrationStatus, Runtime, StartError};

#[derive(Clone)]
pub struct GatewayState {
    pub runtime: Arc<Runtime>,
}

/// Build the gateway router over a running `Runtime`.
pub fn build_router(runtime: Arc<Runtime>) -> Router {
    // One path shape serves both verbs: POST keys on orchestration name,
    // GET keys on instance id.
    Router::new()
        .route(
            "/orchestrations/:key",
            post(start_orchestration).get(get_status),
        )
        .with_state(GatewayState { runtime })
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    /// Caller-chosen instance id; omitted means the gateway generates one.
    instance_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    instance_id: String,
    status_query_url: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    instance_id: String,
    runtime_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn start_orchestration(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Query(query): Query<StartQuery>,
    body: String,
) -> Result<Response, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "orchestration name must not be empty".into(),
        ));
    }
    if let Some(id) = &query.instance_id {
        if id.trim().is_empty() {
            return Err(ApiError::BadRequest("instance_id must not be empty".into()));
        }
    }

    let result = match &query.instance_id {
        Some(id) => state.runtime.start_orchestration(id, &name, body).await,
        None => state.runtime.start_orchestration_generated(&name, body).await,
    };
    let instance_id = match result {
        Ok(id) => id,
        Err(StartError::Conflict { instance }) => return Err(ApiError::Conflict(instance)),
        Err(StartError::Store(msg)) => return Err(ApiError::Internal(msg)),
    };

    info!(instance = %instance_id, orchestration = %name, "accepted start request");
    let payload = StartResponse {
        status_query_url: format!("/orchestrations/{instance_id}"),
        instance_id,
    };
    Ok((StatusCode::ACCEPTED, Json(payload)).into_response())
}

async fn get_status(
    State(state): State<GatewayState>,
    Path(instance_id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.runtime.get_orchestration_status(&instance_id).await;
    let runtime_status = status.as_str();
    let (output, error) = match status {
        OrchestrationStatus::NotFound => return Err(ApiError::NotFound(instance_id)),
        OrchestrationStatus::Completed { output } => {
            // Structured outputs come back as JSON; anything else as a string.
            let value = serde_json::from_str::<serde_json::Value>(&output)
                .unwrap_or(serde_json::Value::String(output));
            (Some(value), None)
        }
        OrchestrationStatus::Failed { error } => (None, Some(error)),
        _ => (None, None),
    };
    let payload = StatusResponse {
        instance_id,
        runtime_status,
        output,
        error,
    };
    Ok(Json(payload).into_response())
}

/// Gateway error taxonomy mapped onto HTTP status codes with a JSON envelope.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no orchestration instance '{id}'"),
            ),
            ApiError::Conflict(id) => (
                StatusCode::CONFLICT,
                "conflict",
                format!("an orchestration with id '{id}' is already running"),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };
        let body = serde_json::json!({
            "error": { "code": code, "message": message }
        });
        (status, Json(body)).into_response()
    }
}
