use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResult, actor};
use crate::core::docker::ContainerAction;
use crate::core::errors::OrchestratorError;

#[derive(Deserialize)]
pub struct ContainersQuery {
    #[serde(default)]
    all: bool,
}

#[derive(Deserialize)]
pub struct ContainerActionRequest {
    container_id: String,
    action: String,
}

pub async fn status_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let status = state.docker.status(&host_id).await?;
    Ok(Json(json!({ "success": true, "status": status })))
}

pub async fn containers_endpoint(
    Path(host_id): Path<String>,
    Query(query): Query<ContainersQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let containers = state.docker.containers(&host_id, query.all).await?;
    Ok(Json(json!({ "success": true, "containers": containers })))
}

pub async fn images_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let images = state.docker.images(&host_id).await?;
    Ok(Json(json!({ "success": true, "images": images })))
}

pub async fn container_action_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ContainerActionRequest>,
) -> ApiResult {
    let action: ContainerAction = payload
        .action
        .trim()
        .parse()
        .map_err(OrchestratorError::InvalidInput)?;
    let report = state
        .docker
        .action(
            &host_id,
            payload.container_id.trim(),
            action,
            &actor(&headers),
            state.command_timeout,
        )
        .await?;
    Ok(Json(json!({ "success": report.success, "report": report })))
}
