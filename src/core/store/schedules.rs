use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::types::{NewSchedule, ScheduleRecord};
use super::{Store, text_col};

/// What to do with `next_run` when a run finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Manual runs leave the natural schedule alone.
    Keep,
    Set(Option<DateTime<Utc>>),
}

const SCHEDULE_COLUMNS: &str = "id, host_id, name, description, container_id, container_name,
    action, schedule_type, cron_expression, interval_seconds, scheduled_at, is_active, is_running,
    last_run, next_run, run_count, success_count, failure_count, timeout_seconds, retry_count,
    retry_delay_seconds, tags, created_at, updated_at";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    let tags_json: String = row.get("tags")?;
    Ok(ScheduleRecord {
        id: row.get("id")?,
        host_id: row.get("host_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        container_id: row.get("container_id")?,
        container_name: row.get("container_name")?,
        action: text_col(row, "action")?,
        schedule_type: text_col(row, "schedule_type")?,
        cron_expression: row.get("cron_expression")?,
        interval_seconds: row.get("interval_seconds")?,
        scheduled_at: row.get("scheduled_at")?,
        is_active: row.get("is_active")?,
        is_running: row.get("is_running")?,
        last_run: row.get("last_run")?,
        next_run: row.get("next_run")?,
        run_count: row.get("run_count")?,
        success_count: row.get("success_count")?,
        failure_count: row.get("failure_count")?,
        timeout_seconds: row.get("timeout_seconds")?,
        retry_count: row.get("retry_count")?,
        retry_delay_seconds: row.get("retry_delay_seconds")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub async fn insert_schedule(&self, new: &NewSchedule) -> Result<ScheduleRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let tags = serde_json::to_string(&new.tags)?;
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO schedules (id, host_id, name, description, container_id, container_name,
                    action, schedule_type, cron_expression, interval_seconds, scheduled_at,
                    next_run, timeout_seconds, retry_count, retry_delay_seconds, tags,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                params![
                    id,
                    new.host_id,
                    new.name,
                    new.description,
                    new.container_id,
                    new.container_name,
                    new.action.as_str(),
                    new.schedule_type.as_str(),
                    new.cron_expression,
                    new.interval_seconds,
                    new.scheduled_at,
                    new.next_run,
                    new.timeout_seconds,
                    new.retry_count,
                    new.retry_delay_seconds,
                    tags,
                    now
                ],
            )?;
        }
        self.get_schedule(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("schedule {} vanished after insert", id))
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS);
        let record = db.query_row(&sql, params![id], schedule_from_row).optional()?;
        Ok(record)
    }

    pub async fn list_schedules(&self, host_id: &str) -> Result<Vec<ScheduleRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM schedules WHERE host_id = ?1 ORDER BY created_at ASC",
            SCHEDULE_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![host_id], schedule_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Writes back every user-editable field plus the recomputed `next_run`.
    pub async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()> {
        let tags = serde_json::to_string(&schedule.tags)?;
        let db = self.db.lock().await;
        db.execute(
            "UPDATE schedules SET
                name = ?2, description = ?3, container_id = ?4, container_name = ?5,
                action = ?6, schedule_type = ?7, cron_expression = ?8, interval_seconds = ?9,
                scheduled_at = ?10, is_active = ?11, next_run = ?12, timeout_seconds = ?13,
                retry_count = ?14, retry_delay_seconds = ?15, tags = ?16, updated_at = ?17
             WHERE id = ?1",
            params![
                schedule.id,
                schedule.name,
                schedule.description,
                schedule.container_id,
                schedule.container_name,
                schedule.action.as_str(),
                schedule.schedule_type.as_str(),
                schedule.cron_expression,
                schedule.interval_seconds,
                schedule.scheduled_at,
                schedule.is_active,
                schedule.next_run,
                schedule.timeout_seconds,
                schedule.retry_count,
                schedule.retry_delay_seconds,
                tags,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    pub async fn set_schedule_active(
        &self,
        id: &str,
        active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE schedules SET is_active = ?2, next_run = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, active, next_run, Utc::now()],
        )?;
        Ok(())
    }

    /// Active, idle schedules whose `next_run` has passed, oldest first.
    pub async fn due_schedules(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduleRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM schedules
             WHERE is_active = 1 AND is_running = 0 AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC LIMIT ?2",
            SCHEDULE_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![now, limit], schedule_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Sets the running flag if it was clear. `false` means another execution
    /// of this schedule already holds it.
    pub async fn claim_schedule(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE schedules SET is_running = 1, updated_at = ?2 WHERE id = ?1 AND is_running = 0",
            params![id, Utc::now()],
        )?;
        Ok(rows == 1)
    }

    /// Counts one completed run, clears the running flag and moves
    /// `next_run`. `deactivate` retires exhausted one-shot schedules.
    pub async fn finish_schedule_run(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        succeeded: bool,
        next_run: NextRun,
        deactivate: bool,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let (success_inc, failure_inc) = if succeeded { (1, 0) } else { (0, 1) };
        db.execute(
            "UPDATE schedules SET
                is_running = 0,
                last_run = ?2,
                run_count = run_count + 1,
                success_count = success_count + ?3,
                failure_count = failure_count + ?4,
                updated_at = ?5
             WHERE id = ?1",
            params![id, started_at, success_inc, failure_inc, Utc::now()],
        )?;
        if let NextRun::Set(next) = next_run {
            db.execute(
                "UPDATE schedules SET next_run = ?2 WHERE id = ?1",
                params![id, next],
            )?;
        }
        if deactivate {
            db.execute(
                "UPDATE schedules SET is_active = 0, next_run = NULL WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }

    /// Clears running flags left behind by a crash. Returns how many were reset.
    pub async fn clear_stale_running(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE schedules SET is_running = 0 WHERE is_running = 1",
            [],
        )?;
        Ok(rows)
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_support::seeded_host;
    use crate::core::store::types::{ScheduleAction, ScheduleType};
    use chrono::Duration;

    fn interval_schedule(host_id: &str, next_run: DateTime<Utc>) -> NewSchedule {
        NewSchedule {
            host_id: host_id.to_string(),
            name: "nightly restart".to_string(),
            description: None,
            container_id: "abc123def456".to_string(),
            container_name: Some("web".to_string()),
            action: ScheduleAction::Restart,
            schedule_type: ScheduleType::Interval,
            cron_expression: None,
            interval_seconds: Some(3600),
            scheduled_at: None,
            timeout_seconds: 300,
            retry_count: 3,
            retry_delay_seconds: 60,
            tags: vec!["web".to_string()],
            next_run: Some(next_run),
        }
    }

    #[tokio::test]
    async fn due_query_skips_inactive_running_and_future() {
        let store = Store::in_memory().unwrap();
        let host = seeded_host(&store).await;
        let now = Utc::now();

        let due = store
            .insert_schedule(&interval_schedule(&host.id, now - Duration::minutes(1)))
            .await
            .unwrap();
        let future = store
            .insert_schedule(&interval_schedule(&host.id, now + Duration::minutes(10)))
            .await
            .unwrap();
        let paused = store
            .insert_schedule(&interval_schedule(&host.id, now - Duration::minutes(1)))
            .await
            .unwrap();
        store
            .set_schedule_active(&paused.id, false, paused.next_run)
            .await
            .unwrap();
        let running = store
            .insert_schedule(&interval_schedule(&host.id, now - Duration::minutes(1)))
            .await
            .unwrap();
        assert!(store.claim_schedule(&running.id).await.unwrap());

        let ids: Vec<String> = store
            .due_schedules(now, 50)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![due.id]);
        assert!(!ids.contains(&future.id));
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_finished() {
        let store = Store::in_memory().unwrap();
        let host = seeded_host(&store).await;
        let s = store
            .insert_schedule(&interval_schedule(&host.id, Utc::now()))
            .await
            .unwrap();
        assert!(store.claim_schedule(&s.id).await.unwrap());
        assert!(!store.claim_schedule(&s.id).await.unwrap());

        let started = Utc::now();
        let next = started + Duration::hours(1);
        store
            .finish_schedule_run(&s.id, started, false, NextRun::Set(Some(next)), false)
            .await
            .unwrap();
        let s = store.get_schedule(&s.id).await.unwrap().unwrap();
        assert!(!s.is_running);
        assert_eq!(s.run_count, 1);
        assert_eq!(s.failure_count, 1);
        assert_eq!(s.success_count, 0);
        assert_eq!(s.next_run, Some(next));
        assert_eq!(s.tags, vec!["web".to_string()]);
        assert!(store.claim_schedule(&s.id).await.unwrap());
    }

    #[tokio::test]
    async fn keep_leaves_next_run_and_deactivate_clears_it() {
        let store = Store::in_memory().unwrap();
        let host = seeded_host(&store).await;
        let original = Utc::now() + Duration::hours(2);
        let s = store
            .insert_schedule(&interval_schedule(&host.id, original))
            .await
            .unwrap();

        store.claim_schedule(&s.id).await.unwrap();
        store
            .finish_schedule_run(&s.id, Utc::now(), true, NextRun::Keep, false)
            .await
            .unwrap();
        assert_eq!(
            store.get_schedule(&s.id).await.unwrap().unwrap().next_run,
            Some(original)
        );

        store.claim_schedule(&s.id).await.unwrap();
        store
            .finish_schedule_run(&s.id, Utc::now(), true, NextRun::Set(None), true)
            .await
            .unwrap();
        let s = store.get_schedule(&s.id).await.unwrap().unwrap();
        assert!(!s.is_active);
        assert!(s.next_run.is_none());
        assert_eq!(s.success_count, 2);
    }

    #[tokio::test]
    async fn stale_running_flags_are_cleared() {
        let store = Store::in_memory().unwrap();
        let host = seeded_host(&store).await;
        let s = store
            .insert_schedule(&interval_schedule(&host.id, Utc::now()))
            .await
            .unwrap();
        store.claim_schedule(&s.id).await.unwrap();
        assert_eq!(store.clear_stale_running().await.unwrap(), 1);
        assert!(!store.get_schedule(&s.id).await.unwrap().unwrap().is_running);
    }
}
