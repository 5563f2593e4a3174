use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{ConfigStatus, ConfigVersionRecord, NewConfigVersion};
use super::{Store, text_col};

/// Line-level change summary against the previous version of a host's config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: i64,
    pub removed: i64,
    pub text: String,
}

const VERSION_SELECT: &str = "SELECT v.id, v.host_id, v.version, v.config_name, v.content, v.checksum,
        v.author, v.summary, v.status, v.diff_added, v.diff_removed, v.diff_text,
        v.validation_output, v.rollback_triggered, v.rollback_reason, v.health_details,
        v.created_at, v.applied_at,
        COALESCE(h.active_config_id = v.id, 0) AS is_active
    FROM config_versions v JOIN hosts h ON h.id = v.host_id";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<ConfigVersionRecord> {
    Ok(ConfigVersionRecord {
        id: row.get("id")?,
        host_id: row.get("host_id")?,
        version: row.get("version")?,
        config_name: row.get("config_name")?,
        content: row.get("content")?,
        checksum: row.get("checksum")?,
        author: row.get("author")?,
        summary: row.get("summary")?,
        status: text_col(row, "status")?,
        is_active: row.get("is_active")?,
        diff_added: row.get("diff_added")?,
        diff_removed: row.get("diff_removed")?,
        diff_text: row.get("diff_text")?,
        validation_output: row.get("validation_output")?,
        rollback_triggered: row.get("rollback_triggered")?,
        rollback_reason: row.get("rollback_reason")?,
        health_details: row.get("health_details")?,
        created_at: row.get("created_at")?,
        applied_at: row.get("applied_at")?,
    })
}

impl Store {
    /// Appends the next version for the host. Numbering and the diff base are
    /// read inside the same transaction, so versions stay gap-free.
    pub async fn insert_config_version<F>(
        &self,
        new: &NewConfigVersion,
        diff: F,
    ) -> Result<ConfigVersionRecord>
    where
        F: FnOnce(Option<&str>, &str) -> DiffSummary + Send,
    {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut db = self.db.lock().await;
            let tx = db.transaction()?;
            let latest: Option<(i64, String)> = tx
                .query_row(
                    "SELECT version, content FROM config_versions
                     WHERE host_id = ?1 ORDER BY version DESC LIMIT 1",
                    params![new.host_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let next_version = latest.as_ref().map(|(v, _)| v + 1).unwrap_or(1);
            let summary = diff(latest.as_ref().map(|(_, c)| c.as_str()), &new.content);

            tx.execute(
                "INSERT INTO config_versions (id, host_id, version, config_name, content, checksum,
                    author, summary, status, diff_added, diff_removed, diff_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    new.host_id,
                    next_version,
                    new.config_name,
                    new.content,
                    new.checksum,
                    new.author,
                    new.summary,
                    ConfigStatus::Draft.as_str(),
                    summary.added,
                    summary.removed,
                    summary.text,
                    Utc::now()
                ],
            )?;
            tx.commit()?;
        }
        self.get_config_version_by_id(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("config version {} vanished after insert", id))
    }

    pub async fn list_config_versions(&self, host_id: &str) -> Result<Vec<ConfigVersionRecord>> {
        let db = self.db.lock().await;
        let sql = format!("{} WHERE v.host_id = ?1 ORDER BY v.version DESC", VERSION_SELECT);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![host_id], version_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn count_config_versions(&self, host_id: &str) -> Result<i64> {
        let db = self.db.lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM config_versions WHERE host_id = ?1",
            params![host_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn get_config_version(
        &self,
        host_id: &str,
        version: i64,
    ) -> Result<Option<ConfigVersionRecord>> {
        let db = self.db.lock().await;
        let sql = format!("{} WHERE v.host_id = ?1 AND v.version = ?2", VERSION_SELECT);
        let record = db
            .query_row(&sql, params![host_id, version], version_from_row)
            .optional()?;
        Ok(record)
    }

    pub async fn get_config_version_by_id(&self, id: &str) -> Result<Option<ConfigVersionRecord>> {
        let db = self.db.lock().await;
        let sql = format!("{} WHERE v.id = ?1", VERSION_SELECT);
        let record = db.query_row(&sql, params![id], version_from_row).optional()?;
        Ok(record)
    }

    pub async fn active_config_version(&self, host_id: &str) -> Result<Option<ConfigVersionRecord>> {
        let db = self.db.lock().await;
        let sql = format!("{} WHERE v.host_id = ?1 AND v.id = h.active_config_id", VERSION_SELECT);
        let record = db
            .query_row(&sql, params![host_id], version_from_row)
            .optional()?;
        Ok(record)
    }

    /// Newest `applied` version other than `excluding`.
    pub async fn last_applied_version(
        &self,
        host_id: &str,
        excluding: Option<&str>,
    ) -> Result<Option<ConfigVersionRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "{} WHERE v.host_id = ?1 AND v.status = ?2 AND v.id != COALESCE(?3, '')
             ORDER BY v.version DESC LIMIT 1",
            VERSION_SELECT
        );
        let record = db
            .query_row(
                &sql,
                params![host_id, ConfigStatus::Applied.as_str(), excluding],
                version_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn set_config_status(&self, id: &str, status: ConfigStatus) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE config_versions SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub async fn set_config_validation(&self, id: &str, output: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE config_versions SET validation_output = ?2 WHERE id = ?1",
            params![id, output],
        )?;
        Ok(())
    }

    /// Candidate is live and under observation: it holds the active pointer
    /// until the watch window either commits or rolls it back.
    pub async fn begin_config_watch(&self, host_id: &str, version_id: &str) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "UPDATE config_versions SET status = ?2 WHERE id = ?1",
            params![version_id, ConfigStatus::Watching.as_str()],
        )?;
        tx.execute(
            "UPDATE hosts SET active_config_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![host_id, version_id, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Marks `version_id` applied and moves the active pointer onto it. When
    /// `superseded` is given (a revert), that version is flagged rolled back.
    pub async fn commit_config_applied(
        &self,
        host_id: &str,
        version_id: &str,
        health_details: Option<&str>,
        superseded: Option<(&str, &str)>,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let now = Utc::now();
        tx.execute(
            "UPDATE config_versions
             SET status = ?2, applied_at = ?3, health_details = COALESCE(?4, health_details)
             WHERE id = ?1",
            params![version_id, ConfigStatus::Applied.as_str(), now, health_details],
        )?;
        if let Some((previous_id, reason)) = superseded {
            if previous_id != version_id {
                tx.execute(
                    "UPDATE config_versions
                     SET status = ?2, rollback_triggered = 1, rollback_reason = ?3
                     WHERE id = ?1",
                    params![previous_id, ConfigStatus::RolledBack.as_str(), reason],
                )?;
            }
        }
        tx.execute(
            "UPDATE hosts SET active_config_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![host_id, version_id, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Candidate failed its watch window and the prior configuration is live
    /// again: the active pointer goes back to `prior_active`.
    pub async fn record_config_rollback(
        &self,
        host_id: &str,
        version_id: &str,
        reason: &str,
        health_details: Option<&str>,
        prior_active: Option<&str>,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "UPDATE config_versions
             SET status = ?2, rollback_triggered = 1, rollback_reason = ?3,
                 health_details = COALESCE(?4, health_details)
             WHERE id = ?1",
            params![
                version_id,
                ConfigStatus::RolledBack.as_str(),
                reason,
                health_details
            ],
        )?;
        tx.execute(
            "UPDATE hosts SET active_config_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![host_id, prior_active, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal failure. `restore_active` puts the pointer back when the
    /// candidate had already taken it.
    pub async fn record_config_failure(
        &self,
        host_id: &str,
        version_id: &str,
        reason: &str,
        rollback_triggered: bool,
        restore_active: Option<Option<&str>>,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "UPDATE config_versions
             SET status = ?2, rollback_reason = ?3, rollback_triggered = ?4
             WHERE id = ?1",
            params![
                version_id,
                ConfigStatus::Failed.as_str(),
                reason,
                rollback_triggered
            ],
        )?;
        if let Some(prior) = restore_active {
            tx.execute(
                "UPDATE hosts SET active_config_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![host_id, prior, Utc::now()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
