mod audit;
mod configs;
mod executions;
mod hosts;
mod schedules;
pub mod types;

pub use audit::AuditEntry;
pub use configs::DiffSummary;
pub use schedules::NextRun;

use anyhow::Result;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub const DB_FILE_NAME: &str = "vpsorch.db";

/// SQLite-backed persistence for hosts, config versions, schedules,
/// execution history and the audit trail.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(&data_dir);

        let db_path = data_dir.join(DB_FILE_NAME);
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        Self::migrate(&db)?;
        info!("Store opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::migrate(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn migrate(db: &Connection) -> Result<()> {
        db.execute_batch("PRAGMA foreign_keys = ON;")?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS hosts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                sealed_credential TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                status_message TEXT,
                active_config_id TEXT,
                auth_failures INTEGER NOT NULL DEFAULT 0,
                last_seen_at TEXT,
                os_info TEXT,
                docker_version TEXT,
                nginx_version TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (address, port, username)
            )",
            [],
        )?;

        // No ON DELETE clause: a host that owns versions cannot be deleted.
        db.execute(
            "CREATE TABLE IF NOT EXISTS config_versions (
                id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id),
                version INTEGER NOT NULL,
                config_name TEXT NOT NULL,
                content TEXT NOT NULL,
                checksum TEXT NOT NULL,
                author TEXT NOT NULL,
                summary TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                diff_added INTEGER NOT NULL DEFAULT 0,
                diff_removed INTEGER NOT NULL DEFAULT 0,
                diff_text TEXT NOT NULL DEFAULT '',
                validation_output TEXT,
                rollback_triggered INTEGER NOT NULL DEFAULT 0,
                rollback_reason TEXT,
                health_details TEXT,
                created_at TEXT NOT NULL,
                applied_at TEXT,
                UNIQUE (host_id, version)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT,
                container_id TEXT NOT NULL,
                container_name TEXT,
                action TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                cron_expression TEXT,
                interval_seconds INTEGER,
                scheduled_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_running INTEGER NOT NULL DEFAULT 0,
                last_run TEXT,
                next_run TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                retry_count INTEGER NOT NULL DEFAULT 3,
                retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS schedule_executions (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
                triggered_by TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                exit_code INTEGER,
                stdout TEXT NOT NULL DEFAULT '',
                stderr TEXT NOT NULL DEFAULT '',
                error_message TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                description TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                error_message TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(is_active, is_running, next_run)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_schedule ON schedule_executions(schedule_id, started_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_log(task_id)",
            [],
        )?;

        Ok(())
    }
}

/// Reads a TEXT column into one of the string-backed enums.
pub(crate) fn text_col<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;
    use super::types::{HostRecord, NewHost};

    pub fn sample_host(address: &str) -> NewHost {
        NewHost {
            name: "edge-1".to_string(),
            address: address.to_string(),
            port: 22,
            username: "root".to_string(),
            auth_type: "password".to_string(),
            sealed_credential: "sealed".to_string(),
        }
    }

    pub async fn seeded_host(store: &Store) -> HostRecord {
        store.insert_host(&sample_host("203.0.113.10")).await.unwrap()
    }
}
