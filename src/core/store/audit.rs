use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use super::types::{AuditRecord, AuditStatus};
use super::{Store, text_col};

const AUDIT_COLUMNS: &str = "id, task_id, action, resource_type, resource_id, actor, description,
    details, status, started_at, completed_at, duration_ms, error_message";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let details: String = row.get("details")?;
    Ok(AuditRecord {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        action: row.get("action")?,
        resource_type: row.get("resource_type")?,
        resource_id: row.get("resource_id")?,
        actor: row.get("actor")?,
        description: row.get("description")?,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        status: text_col(row, "status")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
        error_message: row.get("error_message")?,
    })
}

/// Who did what to which resource.
#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub actor: &'a str,
    pub description: String,
}

impl Store {
    /// Opens a pending audit row and returns its task id.
    pub async fn start_audit(&self, entry: &AuditEntry<'_>) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO audit_log (id, task_id, action, resource_type, resource_id, actor,
                description, details, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?9)",
            params![
                uuid::Uuid::new_v4().to_string(),
                task_id,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.actor,
                entry.description,
                AuditStatus::Pending.as_str(),
                Utc::now()
            ],
        )?;
        Ok(task_id)
    }

    pub async fn complete_audit(
        &self,
        task_id: &str,
        status: AuditStatus,
        error: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let started_at: Option<DateTime<Utc>> = db
            .query_row(
                "SELECT started_at FROM audit_log WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .ok();
        let duration_ms = started_at.map(|s| (now - s).num_milliseconds());
        db.execute(
            "UPDATE audit_log SET status = ?2, error_message = ?3, details = ?4,
                completed_at = ?5, duration_ms = ?6
             WHERE task_id = ?1",
            params![
                task_id,
                status.as_str(),
                error,
                serde_json::to_string(details)?,
                now,
                duration_ms
            ],
        )?;
        Ok(())
    }

    /// Records an action that finished immediately.
    pub async fn log_audit(
        &self,
        entry: &AuditEntry<'_>,
        status: AuditStatus,
        error: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<String> {
        let task_id = self.start_audit(entry).await?;
        self.complete_audit(&task_id, status, error, details).await?;
        Ok(task_id)
    }

    pub async fn get_audit(&self, task_id: &str) -> Result<Option<AuditRecord>> {
        use rusqlite::OptionalExtension;
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM audit_log WHERE task_id = ?1", AUDIT_COLUMNS);
        let record = db.query_row(&sql, params![task_id], audit_from_row).optional()?;
        Ok(record)
    }

    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM audit_log ORDER BY started_at DESC LIMIT ?1",
            AUDIT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], audit_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Failed actions on one kind of resource since `since`, newest first.
    pub async fn recent_failures(
        &self,
        resource_type: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM audit_log
             WHERE resource_type = ?1 AND status = ?2 AND started_at >= ?3
             ORDER BY started_at DESC LIMIT ?4",
            AUDIT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![resource_type, AuditStatus::Failed.as_str(), since, limit],
            audit_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
