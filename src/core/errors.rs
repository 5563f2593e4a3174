use thiserror::Error;

/// Transport-level failures of a remote call. Callers pick their recovery
/// from the variant, this layer never retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("host {host} is unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("authentication failed for {user}@{host}")]
    AuthenticationFailed { host: String, user: String },

    #[error("remote call to {host} timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    #[error("file operation on {path} failed: {message}")]
    FileOperation { path: String, message: String },

    #[error("local transport error: {0}")]
    Io(String),
}

impl RemoteError {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Unreachable { .. } => "remote_unreachable",
            RemoteError::AuthenticationFailed { .. } => "authentication_failed",
            RemoteError::Timeout { .. } => "remote_timeout",
            RemoteError::FileOperation { .. } => "file_operation_failed",
            RemoteError::Io(_) => "transport_io",
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("host {0} is busy with another apply or rollback")]
    HostBusy(String),

    #[error("schedule {0} is already running")]
    ScheduleBusy(String),

    #[error("remote command failed: {0}")]
    CommandFailed(String),

    #[error("service reload failed: {0}")]
    ReloadFailed(String),

    #[error("health degraded: {0}")]
    HealthDegraded(String),

    #[error("rollback failed, manual intervention required: {0}")]
    RollbackFailed(String),

    #[error("gave up after {attempts} attempts: {message}")]
    ScheduleRetriesExhausted { attempts: u32, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::Storage(e.into())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Storage(e.into())
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Remote(e) => e.kind(),
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvalidInput(_) => "invalid_input",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::HostBusy(_) => "host_busy",
            OrchestratorError::ScheduleBusy(_) => "schedule_busy",
            OrchestratorError::CommandFailed(_) => "command_failed",
            OrchestratorError::ReloadFailed(_) => "reload_failed",
            OrchestratorError::HealthDegraded(_) => "health_degraded",
            OrchestratorError::RollbackFailed(_) => "rollback_failed",
            OrchestratorError::ScheduleRetriesExhausted { .. } => "schedule_retries_exhausted",
            OrchestratorError::Storage(_) => "storage",
        }
    }
}

pub type OrchResult<T> = std::result::Result<T, OrchestratorError>;
