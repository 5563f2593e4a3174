pub mod audit;
pub mod docker;
pub mod hosts;
pub mod nginx;
pub mod schedules;
pub mod terminal;

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::core::errors::{OrchestratorError, RemoteError};

/// Header a UI may set to attribute actions in the audit log.
const ACTOR_HEADER: &str = "x-vpsorch-actor";

pub(crate) type ApiResult = Result<Json<Value>, ApiError>;

/// An `OrchestratorError` on its way out as
/// `{"success": false, "error": ..., "kind": ...}`.
#[derive(Debug)]
pub(crate) struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(OrchestratorError::Storage(e))
    }
}

pub(crate) fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Conflict(_)
        | OrchestratorError::HostBusy(_)
        | OrchestratorError::ScheduleBusy(_) => StatusCode::CONFLICT,
        OrchestratorError::Remote(RemoteError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Remote(_)
        | OrchestratorError::CommandFailed(_)
        | OrchestratorError::ReloadFailed(_)
        | OrchestratorError::HealthDegraded(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::RollbackFailed(_)
        | OrchestratorError::ScheduleRetriesExhausted { .. }
        | OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("API error ({}): {}", self.0.kind(), self.0);
        } else {
            warn!("API request rejected ({}): {}", self.0.kind(), self.0);
        }
        (
            status,
            Json(json!({
                "success": false,
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

pub(crate) fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .unwrap_or("api")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_conflict_errors_map_to_409() {
        for err in [
            OrchestratorError::HostBusy("h1".into()),
            OrchestratorError::ScheduleBusy("s1".into()),
            OrchestratorError::Conflict("dup".into()),
        ] {
            assert_eq!(status_for(&err), StatusCode::CONFLICT);
        }
    }

    #[test]
    fn transport_errors_map_to_gateway_statuses() {
        let timeout = OrchestratorError::Remote(RemoteError::Timeout {
            host: "10.0.0.1".into(),
            seconds: 30,
        });
        assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);
        let auth = OrchestratorError::Remote(RemoteError::AuthenticationFailed {
            host: "10.0.0.1".into(),
            user: "root".into(),
        });
        assert_eq!(status_for(&auth), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&OrchestratorError::NotFound("host x".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn actor_header_falls_back_to_api() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor(&headers), "api");
        headers.insert(ACTOR_HEADER, "alice".parse().unwrap());
        assert_eq!(actor(&headers), "alice");
    }
}
