//! Admin route handlers: health, testnet exchange info, and the execution
//! session lifecycle.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::book::SyncState;
use crate::execution::{ExecutionSettings, ExecutionStatus, SymbolFilters};

use super::ApiState;

/// Build the admin API router.
pub fn api_router() -> Router<ApiState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/testnet/exchange-info", get(exchange_info))
        .route("/api/execution/status", get(execution_status))
        .route("/api/execution/connect", post(execution_connect))
        .route("/api/execution/disconnect", post(execution_disconnect))
        .route("/api/execution/enabled", post(execution_enabled))
        .route("/api/execution/settings", post(execution_settings))
        .route("/api/execution/symbol", post(execution_symbol))
}

// ===== Route Handlers =====

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let symbols: Vec<serde_json::Value> = state
        .registry
        .iter()
        .map(|pipeline| {
            let sync = pipeline.sync.lock();
            json!({
                "symbol": pipeline.symbol,
                "state": match sync.state() {
                    SyncState::Init => "INIT",
                    SyncState::Synced => "SYNCED",
                    SyncState::Resync => "RESYNC",
                },
                "lastUpdateId": sync.book().last_update_id(),
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "symbols": symbols,
        "subscribers": state.hub.subscriber_count(),
        "loggerDropped": state.logger.dropped(),
    }))
}

async fn exchange_info(
    State(state): State<ApiState>,
) -> Result<Json<Vec<SymbolFilters>>, ApiError> {
    let filters = state
        .execution
        .exchange_info()
        .await
        .map_err(ApiError::Upstream)?;
    Ok(Json(filters))
}

async fn execution_status(State(state): State<ApiState>) -> Json<ExecutionStatus> {
    Json(state.execution.status())
}

async fn execution_connect(
    State(state): State<ApiState>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    state
        .execution
        .connect()
        .await
        .map(Json)
        .map_err(ApiError::Upstream)
}

async fn execution_disconnect(State(state): State<ApiState>) -> Json<ExecutionStatus> {
    Json(state.execution.disconnect())
}

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn execution_enabled(
    State(state): State<ApiState>,
    Json(body): Json<EnabledRequest>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    state
        .execution
        .set_enabled(body.enabled)
        .map(Json)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn execution_settings(
    State(state): State<ApiState>,
    Json(body): Json<ExecutionSettings>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    state
        .execution
        .update_settings(body)
        .map(Json)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

async fn execution_symbol(
    State(state): State<ApiState>,
    Json(body): Json<SymbolRequest>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    state
        .execution
        .set_symbol(&body.symbol)
        .map(Json)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Upstream(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Upstream(err) => {
                tracing::error!("upstream error: {err:#}");
                (StatusCode::BAD_GATEWAY, err.to_string())
            }
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
