use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Value, json};

use super::super::AppState;
use super::ApiResult;
use crate::core::errors::OrchestratorError;
use crate::core::schedule::{ScheduleRequest, ScheduleUpdate};
use crate::core::store::types::ScheduleRecord;

const DEFAULT_EXECUTION_LIMIT: u32 = 50;
const MAX_EXECUTION_LIMIT: u32 = 500;

#[derive(Deserialize)]
pub struct ExecutionsQuery {
    #[serde(default)]
    limit: Option<u32>,
}

fn local(ts: Option<DateTime<Utc>>, tz: Tz) -> Option<String> {
    ts.map(|t| t.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z").to_string())
}

/// Stored record plus its run times in the operating timezone.
fn schedule_view(record: &ScheduleRecord, tz: Tz) -> Value {
    let mut view = json!(record);
    view["next_run_local"] = json!(local(record.next_run, tz));
    view["last_run_local"] = json!(local(record.last_run, tz));
    view["timezone"] = json!(tz.name());
    view
}

pub async fn list_schedules_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    if state.store.get_host(&host_id).await?.is_none() {
        return Err(OrchestratorError::NotFound(format!("host {}", host_id)).into());
    }
    let schedules = state.schedules.list(&host_id).await?;
    let views: Vec<Value> = schedules
        .iter()
        .map(|s| schedule_view(s, state.timezone))
        .collect();
    Ok(Json(json!({ "success": true, "schedules": views })))
}

pub async fn create_schedule_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ScheduleRequest>,
) -> ApiResult {
    let record = state.schedules.create(&host_id, payload).await?;
    Ok(Json(json!({
        "success": true,
        "schedule": schedule_view(&record, state.timezone),
    })))
}

pub async fn get_schedule_endpoint(
    Path(schedule_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let record = state.schedules.get(&schedule_id).await?;
    Ok(Json(json!({
        "success": true,
        "schedule": schedule_view(&record, state.timezone),
    })))
}

pub async fn update_schedule_endpoint(
    Path(schedule_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ScheduleUpdate>,
) -> ApiResult {
    let record = state.schedules.update(&schedule_id, payload).await?;
    Ok(Json(json!({
        "success": true,
        "schedule": schedule_view(&record, state.timezone),
    })))
}

pub async fn delete_schedule_endpoint(
    Path(schedule_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    state.schedules.delete(&schedule_id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn execute_schedule_endpoint(
    Path(schedule_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let execution = state.schedules.execute_now(&schedule_id).await?;
    Ok(Json(json!({ "success": true, "execution": execution })))
}

pub async fn toggle_schedule_endpoint(
    Path(schedule_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let record = state.schedules.toggle(&schedule_id).await?;
    Ok(Json(json!({
        "success": true,
        "schedule": schedule_view(&record, state.timezone),
    })))
}

pub async fn executions_endpoint(
    Path(schedule_id): Path<String>,
    Query(query): Query<ExecutionsQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EXECUTION_LIMIT)
        .clamp(1, MAX_EXECUTION_LIMIT);
    let executions = state.schedules.executions(&schedule_id, limit).await?;
    Ok(Json(json!({ "success": true, "executions": executions })))
}
