use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde_json::json;

use super::super::AppState;
use super::{ApiResult, actor};
use crate::core::hosts::OnboardRequest;

pub async fn onboard_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<OnboardRequest>,
) -> ApiResult {
    let outcome = state.hosts.onboard(payload, &actor(&headers)).await?;
    Ok(Json(json!({
        "success": true,
        "task_id": outcome.task_id,
        "host": outcome.host,
        "bootstrap": outcome.bootstrap,
    })))
}

pub async fn list_hosts_endpoint(State(state): State<AppState>) -> ApiResult {
    let hosts = state.hosts.list().await?;
    Ok(Json(json!({ "success": true, "hosts": hosts })))
}

pub async fn get_host_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let host = state.hosts.get(&host_id).await?;
    Ok(Json(json!({ "success": true, "host": host })))
}

pub async fn delete_host_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult {
    state.hosts.delete(&host_id, &actor(&headers)).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn health_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let health = state.hosts.health(&host_id).await?;
    Ok(Json(json!({ "success": true, "health": health })))
}

pub async fn bootstrap_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult {
    let report = state.hosts.bootstrap(&host_id, &actor(&headers)).await?;
    Ok(Json(json!({ "success": report.success, "report": report })))
}
