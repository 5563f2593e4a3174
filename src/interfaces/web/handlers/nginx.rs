use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{error, info};

use super::super::AppState;
use super::{ApiError, ApiResult, actor};
use crate::core::errors::OrchestratorError;
use crate::core::nginx::{ApplyRequest, DraftRequest};

/// Upper bound on a caller-chosen watch window.
const MAX_WATCH_WINDOW_SECS: u64 = 3600;

#[derive(Deserialize)]
pub struct CreateDraftRequest {
    content: String,
    #[serde(default)]
    config_name: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Deserialize)]
pub struct PreviewRequest {
    content: String,
}

#[derive(Deserialize)]
pub struct ApplyPayload {
    config_id: String,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    watch_window_seconds: Option<u64>,
    /// Await the whole pipeline instead of answering 202.
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize, Default)]
pub struct RevertPayload {
    #[serde(default)]
    target_version: Option<i64>,
}

pub async fn list_configs_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let versions = state.nginx.list(&host_id).await?;
    Ok(Json(json!({ "success": true, "configs": versions })))
}

pub async fn create_config_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateDraftRequest>,
) -> ApiResult {
    let record = state
        .nginx
        .create_draft(
            &host_id,
            DraftRequest {
                content: payload.content,
                config_name: payload.config_name,
                summary: payload.summary,
                author: actor(&headers),
            },
        )
        .await?;
    Ok(Json(json!({ "success": true, "config": record })))
}

pub async fn get_config_endpoint(
    Path((host_id, version)): Path<(String, i64)>,
    State(state): State<AppState>,
) -> ApiResult {
    let record = state.nginx.get(&host_id, version, false).await?;
    Ok(Json(json!({ "success": true, "config": record })))
}

pub async fn preview_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<PreviewRequest>,
) -> ApiResult {
    let validation = state.nginx.preview(&host_id, &payload.content).await?;
    Ok(Json(json!({ "success": true, "validation": validation })))
}

/// Claims the host lock before answering, so a concurrent apply is a 409
/// right away. Dry runs and `wait` requests return the final outcome;
/// everything else continues in the background under the returned task id.
pub async fn apply_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ApplyPayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let belongs = state
        .store
        .get_config_version_by_id(&payload.config_id)
        .await?
        .is_some_and(|v| v.host_id == host_id);
    if !belongs {
        return Err(OrchestratorError::NotFound(format!(
            "config version {} of host {}",
            payload.config_id, host_id
        ))
        .into());
    }
    if payload.watch_window_seconds.is_some_and(|s| s > MAX_WATCH_WINDOW_SECS) {
        return Err(OrchestratorError::InvalidInput(format!(
            "watch_window_seconds must be at most {}",
            MAX_WATCH_WINDOW_SECS
        ))
        .into());
    }

    let prepared = state
        .apply
        .prepare(ApplyRequest {
            config_id: payload.config_id,
            dry_run: payload.dry_run,
            watch_window: payload.watch_window_seconds.map(Duration::from_secs),
            actor: actor(&headers),
        })
        .await?;

    if payload.wait || payload.dry_run {
        let outcome = state.apply.run(prepared).await?;
        return Ok((
            StatusCode::OK,
            Json(json!({ "success": true, "outcome": outcome })),
        ));
    }

    let task_id = prepared.task_id().to_string();
    let version = prepared.version().version;
    let apply = state.apply.clone();
    tokio::spawn(async move {
        match apply.run(prepared).await {
            Ok(outcome) => info!(
                "Background apply {} finished: {}",
                outcome.task_id, outcome.message
            ),
            Err(e) => error!("Background apply failed: {}", e),
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "task_id": task_id,
            "version": version,
            "message": "apply started; poll /api/audit/{task_id} for the result",
        })),
    ))
}

pub async fn revert_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Option<Json<RevertPayload>>,
) -> ApiResult {
    let Json(payload) = payload.unwrap_or_default();
    let outcome = state
        .apply
        .revert(&host_id, payload.target_version, &actor(&headers))
        .await?;
    Ok(Json(json!({ "success": true, "outcome": outcome })))
}

pub async fn status_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let status = state.nginx.status(&host_id).await?;
    Ok(Json(json!({ "success": true, "status": status })))
}

pub async fn templates_endpoint(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({
        "success": true,
        "templates": state.nginx.templates(),
    })))
}
