use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::ApiResult;
use crate::core::errors::OrchestratorError;

#[derive(Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    limit: Option<u32>,
}

pub async fn recent_audit_endpoint(
    Query(query): Query<AuditQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let records = state.store.recent_audit(limit).await?;
    Ok(Json(json!({ "success": true, "audit": records })))
}

/// Status of one task, e.g. a background apply.
pub async fn audit_task_endpoint(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let record = state
        .store
        .get_audit(&task_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", task_id)))?;
    Ok(Json(json!({ "success": true, "task": record })))
}
