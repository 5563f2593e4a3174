use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use super::types::ExecutionRecord;
use super::{Store, text_col};

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get("id")?,
        schedule_id: row.get("schedule_id")?,
        triggered_by: row.get("triggered_by")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
        outcome: text_col(row, "outcome")?,
        attempt_number: row.get("attempt_number")?,
        exit_code: row.get("exit_code")?,
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        error_message: row.get("error_message")?,
    })
}

impl Store {
    pub async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO schedule_executions (id, schedule_id, triggered_by, started_at,
                completed_at, duration_ms, outcome, attempt_number, exit_code, stdout, stderr,
                error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.schedule_id,
                record.triggered_by,
                record.started_at,
                record.completed_at,
                record.duration_ms,
                record.outcome.as_str(),
                record.attempt_number,
                record.exit_code,
                record.stdout,
                record.stderr,
                record.error_message
            ],
        )?;
        Ok(())
    }

    /// Most recent first.
    pub async fn list_executions(
        &self,
        schedule_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, schedule_id, triggered_by, started_at, completed_at, duration_ms, outcome,
                    attempt_number, exit_code, stdout, stderr, error_message
             FROM schedule_executions
             WHERE schedule_id = ?1
             ORDER BY started_at DESC, attempt_number DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![schedule_id, limit], execution_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn delete_executions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM schedule_executions WHERE started_at < ?1",
            params![cutoff],
        )?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_support::seeded_host;
    use crate::core::store::types::{ExecutionOutcome, NewSchedule, ScheduleAction, ScheduleType};
    use chrono::Duration;

    async fn schedule_id(store: &Store) -> String {
        let host = seeded_host(store).await;
        store
            .insert_schedule(&NewSchedule {
                host_id: host.id,
                name: "restart".to_string(),
                description: None,
                container_id: "web".to_string(),
                container_name: None,
                action: ScheduleAction::Restart,
                schedule_type: ScheduleType::Interval,
                cron_expression: None,
                interval_seconds: Some(600),
                scheduled_at: None,
                timeout_seconds: 60,
                retry_count: 0,
                retry_delay_seconds: 0,
                tags: Vec::new(),
                next_run: None,
            })
            .await
            .unwrap()
            .id
    }

    fn execution(schedule_id: &str, started_at: DateTime<Utc>, attempt: i64) -> ExecutionRecord {
        ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            triggered_by: "scheduler".to_string(),
            started_at,
            completed_at: started_at + Duration::seconds(2),
            duration_ms: 2000,
            outcome: ExecutionOutcome::Failure,
            attempt_number: attempt,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "no such container".to_string(),
            error_message: Some("no such container".to_string()),
        }
    }

    #[tokio::test]
    async fn executions_list_newest_first() {
        let store = Store::in_memory().unwrap();
        let sid = schedule_id(&store).await;
        let now = Utc::now();
        store.insert_execution(&execution(&sid, now, 1)).await.unwrap();
        store
            .insert_execution(&execution(&sid, now + Duration::seconds(5), 2))
            .await
            .unwrap();

        let listed = store.list_executions(&sid, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].attempt_number, 2);
        assert_eq!(listed[1].outcome, ExecutionOutcome::Failure);
    }

    #[tokio::test]
    async fn old_executions_are_pruned() {
        let store = Store::in_memory().unwrap();
        let sid = schedule_id(&store).await;
        let now = Utc::now();
        store
            .insert_execution(&execution(&sid, now - Duration::days(40), 1))
            .await
            .unwrap();
        store.insert_execution(&execution(&sid, now, 1)).await.unwrap();

        let removed = store
            .delete_executions_before(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_executions(&sid, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_schedule_cascades_history() {
        let store = Store::in_memory().unwrap();
        let sid = schedule_id(&store).await;
        store
            .insert_execution(&execution(&sid, Utc::now(), 1))
            .await
            .unwrap();
        assert!(store.delete_schedule(&sid).await.unwrap());
        assert!(store.list_executions(&sid, 10).await.unwrap().is_empty());
    }
}
