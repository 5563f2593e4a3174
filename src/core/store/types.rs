use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// String-backed enum stored as TEXT and serialized in snake_case.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    HostState {
        Pending => "pending",
        Active => "active",
        Inactive => "inactive",
        Error => "error",
        RequiresManualIntervention => "requires_manual_intervention",
    }
);

text_enum!(
    /// `staged` and `watching` are transient: they are only visible while an
    /// apply sequence holds the host lock.
    ConfigStatus {
        Draft => "draft",
        Staged => "staged",
        Watching => "watching",
        Applied => "applied",
        RolledBack => "rolled_back",
        Failed => "failed",
    }
);

text_enum!(
    ScheduleAction {
        Start => "start",
        Stop => "stop",
        Restart => "restart",
    }
);

text_enum!(
    ScheduleType {
        Cron => "cron",
        Interval => "interval",
        Once => "once",
    }
);

text_enum!(
    ExecutionOutcome {
        Success => "success",
        Failure => "failure",
        Timeout => "timeout",
    }
);

text_enum!(
    AuditStatus {
        Pending => "pending",
        Success => "success",
        Failed => "failed",
    }
);

#[derive(Debug, Clone, Serialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth_type: String,
    #[serde(skip)]
    pub sealed_credential: String,
    pub state: HostState,
    pub status_message: Option<String>,
    /// Pointer to the single active config version, moved only by the
    /// apply/rollback engine.
    pub active_config_id: Option<String>,
    pub auth_failures: u32,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub os_info: Option<String>,
    pub docker_version: Option<String>,
    pub nginx_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHost {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth_type: String,
    pub sealed_credential: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigVersionRecord {
    pub id: String,
    pub host_id: String,
    pub version: i64,
    pub config_name: String,
    pub content: String,
    pub checksum: String,
    pub author: String,
    pub summary: String,
    pub status: ConfigStatus,
    pub is_active: bool,
    pub diff_added: i64,
    pub diff_removed: i64,
    pub diff_text: String,
    pub validation_output: Option<String>,
    pub rollback_triggered: bool,
    pub rollback_reason: Option<String>,
    pub health_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewConfigVersion {
    pub host_id: String,
    pub config_name: String,
    pub content: String,
    pub checksum: String,
    pub author: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub host_id: String,
    pub name: String,
    pub description: Option<String>,
    pub container_id: String,
    pub container_name: Option<String>,
    pub action: ScheduleAction,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub timeout_seconds: i64,
    pub retry_count: i64,
    pub retry_delay_seconds: i64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub host_id: String,
    pub name: String,
    pub description: Option<String>,
    pub container_id: String,
    pub container_name: Option<String>,
    pub action: ScheduleAction,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_seconds: i64,
    pub retry_count: i64,
    pub retry_delay_seconds: i64,
    pub tags: Vec<String>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub schedule_id: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub outcome: ExecutionOutcome,
    pub attempt_number: i64,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: String,
    pub task_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: String,
    pub description: String,
    pub details: serde_json::Value,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}
