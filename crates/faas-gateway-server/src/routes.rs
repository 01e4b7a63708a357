//! Loopback HTTP surface.
//!
//! `POST /invoke/:function_id` goes through a [`StubClient`], so a request made with curl
//! takes the same path over the transport as a call from the deployed stub.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use faas_executor::{WorkerInfo, WorkerPool};
use faas_gateway::{GatewayError, StubClient};
use faas_orchestrator::BuildOrchestrator;
use serde::Serialize;
use tracing::{info, instrument};

pub const WORKER_ID_HEADER: &str = "x-worker-id";
pub const TIMEOUT_HEADER: &str = "x-timeout-ms";

#[derive(Clone)]
pub struct AppState {
    pub pool: WorkerPool,
    pub orchestrator: BuildOrchestrator,
    pub client: StubClient,
    pub default_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
    code: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            code: code.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout { .. } => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string())
            }
            other => ApiError::new(StatusCode::BAD_GATEWAY, "TRANSPORT", other.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/workers", get(workers_handler))
        .route("/invoke/:function_id", post(invoke_handler))
        .route("/functions/:function_id/rebuild", post(rebuild_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "faas-dev",
        "functions": state.orchestrator.definitions().len(),
        "buildsInFlight": state.orchestrator.builds_in_flight(),
    }))
}

async fn workers_handler(State(state): State<AppState>) -> Json<Vec<WorkerInfo>> {
    Json(state.pool.snapshot())
}

#[instrument(skip(state, headers, body))]
async fn invoke_handler(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !state
        .orchestrator
        .definitions()
        .iter()
        .any(|def| def.function_id == function_id)
    {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("no function {function_id}"),
        ));
    }

    let event = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, "INVALID_EVENT", e.to_string())
        })?
    };
    let worker_id = header(&headers, WORKER_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| format!("local-{function_id}"));
    let timeout = match header(&headers, TIMEOUT_HEADER) {
        Some(raw) => raw.parse().map(Duration::from_millis).map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_TIMEOUT",
                format!("{TIMEOUT_HEADER} must be milliseconds, got {raw:?}"),
            )
        })?,
        None => state.default_timeout,
    };

    let result = state
        .client
        .call(&function_id, &worker_id, event, timeout)
        .await?;
    info!(result = %result, "Loopback invocation finished");
    Ok(Json(result).into_response())
}

async fn rebuild_handler(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .rebuild(&function_id)
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
