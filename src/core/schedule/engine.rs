use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cron::CronExpr;
use crate::core::docker::{ContainerAction, DockerSupervisor, validate_container_ref};
use crate::core::errors::{OrchResult, OrchestratorError, RemoteError};
use crate::core::hosts::TargetResolver;
use crate::core::store::types::{
    ExecutionOutcome, ExecutionRecord, NewSchedule, ScheduleAction, ScheduleRecord, ScheduleType,
};
use crate::core::store::{NextRun, Store};

pub const MIN_INTERVAL_SECS: i64 = 60;
pub const MAX_TIMEOUT_SECS: i64 = 3600;
pub const MAX_RETRIES: i64 = 10;
pub const MAX_RETRY_DELAY_SECS: i64 = 3600;

/// How long `delete` waits on a claimed schedule before giving up.
const DELETE_POLL: Duration = Duration::from_millis(50);
const DELETE_MAX_POLLS: u32 = 100;

fn default_timeout() -> i64 {
    300
}
fn default_retry_count() -> i64 {
    3
}
fn default_retry_delay() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub container_id: String,
    #[serde(default)]
    pub container_name: Option<String>,
    pub action: ScheduleAction,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default = "default_retry_count")]
    pub retry_count: i64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial edit; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub action: Option<ScheduleAction>,
    pub schedule_type: Option<ScheduleType>,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub retry_count: Option<i64>,
    pub retry_delay_seconds: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

impl From<&ScheduleRecord> for ScheduleRequest {
    fn from(s: &ScheduleRecord) -> Self {
        Self {
            name: s.name.clone(),
            description: s.description.clone(),
            container_id: s.container_id.clone(),
            container_name: s.container_name.clone(),
            action: s.action,
            schedule_type: s.schedule_type,
            cron_expression: s.cron_expression.clone(),
            interval_seconds: s.interval_seconds,
            scheduled_at: s.scheduled_at,
            timeout_seconds: s.timeout_seconds,
            retry_count: s.retry_count,
            retry_delay_seconds: s.retry_delay_seconds,
            tags: s.tags.clone(),
        }
    }
}

impl ScheduleUpdate {
    fn merge(self, mut base: ScheduleRequest) -> ScheduleRequest {
        // A new type starts from a clean slate of type parameters.
        if self.schedule_type.is_some_and(|t| t != base.schedule_type) {
            base.cron_expression = None;
            base.interval_seconds = None;
            base.scheduled_at = None;
        }
        if let Some(v) = self.name {
            base.name = v;
        }
        if let Some(v) = self.description {
            base.description = Some(v);
        }
        if let Some(v) = self.container_id {
            base.container_id = v;
        }
        if let Some(v) = self.container_name {
            base.container_name = Some(v);
        }
        if let Some(v) = self.action {
            base.action = v;
        }
        if let Some(v) = self.schedule_type {
            base.schedule_type = v;
        }
        if let Some(v) = self.cron_expression {
            base.cron_expression = Some(v);
        }
        if let Some(v) = self.interval_seconds {
            base.interval_seconds = Some(v);
        }
        if let Some(v) = self.scheduled_at {
            base.scheduled_at = Some(v);
        }
        if let Some(v) = self.timeout_seconds {
            base.timeout_seconds = v;
        }
        if let Some(v) = self.retry_count {
            base.retry_count = v;
        }
        if let Some(v) = self.retry_delay_seconds {
            base.retry_delay_seconds = v;
        }
        if let Some(v) = self.tags {
            base.tags = v;
        }
        base
    }
}

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidInput(msg.into())
}

/// Rejects anything that could only fail later at dispatch time.
fn check_request(req: &ScheduleRequest, now: DateTime<Utc>) -> OrchResult<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("schedule name is empty"));
    }
    validate_container_ref(&req.container_id)?;
    let (field, stray) = match req.schedule_type {
        ScheduleType::Cron => (
            "cron_expression",
            req.interval_seconds.is_some() || req.scheduled_at.is_some(),
        ),
        ScheduleType::Interval => (
            "interval_seconds",
            req.cron_expression.is_some() || req.scheduled_at.is_some(),
        ),
        ScheduleType::Once => (
            "scheduled_at",
            req.cron_expression.is_some() || req.interval_seconds.is_some(),
        ),
    };
    if stray {
        return Err(invalid(format!(
            "{} schedules take only {}",
            req.schedule_type, field
        )));
    }
    match req.schedule_type {
        ScheduleType::Cron => {
            let expr = req
                .cron_expression
                .as_deref()
                .ok_or_else(|| invalid("cron schedules need cron_expression"))?;
            CronExpr::parse(expr)?;
        }
        ScheduleType::Interval => match req.interval_seconds {
            Some(secs) if secs >= MIN_INTERVAL_SECS => {}
            Some(secs) => {
                return Err(invalid(format!(
                    "interval_seconds must be at least {}, got {}",
                    MIN_INTERVAL_SECS, secs
                )));
            }
            None => return Err(invalid("interval schedules need interval_seconds")),
        },
        ScheduleType::Once => match req.scheduled_at {
            Some(at) if at > now => {}
            Some(_) => return Err(invalid("scheduled_at must be in the future")),
            None => return Err(invalid("once schedules need scheduled_at")),
        },
    }
    if !(1..=MAX_TIMEOUT_SECS).contains(&req.timeout_seconds) {
        return Err(invalid(format!(
            "timeout_seconds must be within 1..={}",
            MAX_TIMEOUT_SECS
        )));
    }
    if !(0..=MAX_RETRIES).contains(&req.retry_count) {
        return Err(invalid(format!("retry_count must be within 0..={}", MAX_RETRIES)));
    }
    if !(0..=MAX_RETRY_DELAY_SECS).contains(&req.retry_delay_seconds) {
        return Err(invalid(format!(
            "retry_delay_seconds must be within 0..={}",
            MAX_RETRY_DELAY_SECS
        )));
    }
    Ok(())
}

/// Where the natural schedule fires next, given the last run (if any).
pub fn next_run_after(
    schedule_type: ScheduleType,
    cron_expression: Option<&str>,
    interval_seconds: Option<i64>,
    scheduled_at: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tz: Tz,
) -> OrchResult<Option<DateTime<Utc>>> {
    Ok(match schedule_type {
        ScheduleType::Cron => {
            let expr = cron_expression.ok_or_else(|| invalid("missing cron_expression"))?;
            CronExpr::parse(expr)?.next_after(now, tz)
        }
        ScheduleType::Interval => {
            let secs = interval_seconds.ok_or_else(|| invalid("missing interval_seconds"))?;
            Some(last_run.unwrap_or(now) + ChronoDuration::seconds(secs))
        }
        ScheduleType::Once => scheduled_at,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduler",
            Trigger::Manual => "manual",
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct AttemptResult {
    outcome: ExecutionOutcome,
    attempts: i64,
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    error_message: Option<String>,
}

/// Fires container actions for due schedules. Each execution runs as its own
/// task; the per-schedule `running` flag in the store keeps executions of one
/// schedule from overlapping.
pub struct ScheduleEngine {
    store: Store,
    targets: TargetResolver,
    supervisor: Arc<DockerSupervisor>,
    tz: Tz,
    batch_limit: u32,
    running: Mutex<HashMap<String, RunHandle>>,
}

impl ScheduleEngine {
    pub fn new(
        store: Store,
        targets: TargetResolver,
        supervisor: Arc<DockerSupervisor>,
        tz: Tz,
        batch_limit: u32,
    ) -> Self {
        Self {
            store,
            targets,
            supervisor,
            tz,
            batch_limit,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunHandle>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn require(&self, id: &str) -> OrchResult<ScheduleRecord> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("schedule {}", id)))
    }

    pub async fn create(&self, host_id: &str, req: ScheduleRequest) -> OrchResult<ScheduleRecord> {
        if self.store.get_host(host_id).await?.is_none() {
            return Err(OrchestratorError::NotFound(format!("host {}", host_id)));
        }
        let now = Utc::now();
        check_request(&req, now)?;
        let next_run = next_run_after(
            req.schedule_type,
            req.cron_expression.as_deref(),
            req.interval_seconds,
            req.scheduled_at,
            None,
            now,
            self.tz,
        )?;
        let new = NewSchedule {
            host_id: host_id.to_string(),
            name: req.name,
            description: req.description,
            container_id: req.container_id,
            container_name: req.container_name,
            action: req.action,
            schedule_type: req.schedule_type,
            cron_expression: req.cron_expression.map(|c| c.trim().to_string()),
            interval_seconds: req.interval_seconds,
            scheduled_at: req.scheduled_at,
            timeout_seconds: req.timeout_seconds,
            retry_count: req.retry_count,
            retry_delay_seconds: req.retry_delay_seconds,
            tags: req.tags,
            next_run,
        };
        let record = self.store.insert_schedule(&new).await?;
        info!(
            "Created {} schedule {} ({} {}) on host {}, next run {:?}",
            record.schedule_type,
            record.id,
            record.action,
            record.container_id,
            host_id,
            record.next_run
        );
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> OrchResult<ScheduleRecord> {
        self.require(id).await
    }

    pub async fn list(&self, host_id: &str) -> OrchResult<Vec<ScheduleRecord>> {
        Ok(self.store.list_schedules(host_id).await?)
    }

    pub async fn executions(&self, id: &str, limit: u32) -> OrchResult<Vec<ExecutionRecord>> {
        self.require(id).await?;
        Ok(self.store.list_executions(id, limit).await?)
    }

    pub async fn update(&self, id: &str, update: ScheduleUpdate) -> OrchResult<ScheduleRecord> {
        let mut record = self.require(id).await?;
        if record.is_running {
            return Err(OrchestratorError::ScheduleBusy(id.to_string()));
        }
        let is_active = update.is_active.unwrap_or(record.is_active);
        let merged = update.merge(ScheduleRequest::from(&record));
        let now = Utc::now();
        check_request(&merged, now)?;

        record.next_run = if is_active {
            next_run_after(
                merged.schedule_type,
                merged.cron_expression.as_deref(),
                merged.interval_seconds,
                merged.scheduled_at,
                None,
                now,
                self.tz,
            )?
        } else {
            None
        };
        record.is_active = is_active;
        record.name = merged.name;
        record.description = merged.description;
        record.container_id = merged.container_id;
        record.container_name = merged.container_name;
        record.action = merged.action;
        record.schedule_type = merged.schedule_type;
        record.cron_expression = merged.cron_expression;
        record.interval_seconds = merged.interval_seconds;
        record.scheduled_at = merged.scheduled_at;
        record.timeout_seconds = merged.timeout_seconds;
        record.retry_count = merged.retry_count;
        record.retry_delay_seconds = merged.retry_delay_seconds;
        record.tags = merged.tags;

        self.store.update_schedule(&record).await?;
        info!("Updated schedule {}", id);
        self.require(id).await
    }

    /// Pausing stops future dispatch only; an execution already in flight
    /// finishes normally.
    pub async fn toggle(&self, id: &str) -> OrchResult<ScheduleRecord> {
        let record = self.require(id).await?;
        let now = Utc::now();
        if record.is_active {
            self.store.set_schedule_active(id, false, None).await?;
            info!("Paused schedule {}", id);
        } else {
            if record.schedule_type == ScheduleType::Once
                && record.scheduled_at.is_none_or(|at| at <= now)
            {
                return Err(invalid(
                    "cannot resume a one-shot schedule whose fire time has passed",
                ));
            }
            let next_run = next_run_after(
                record.schedule_type,
                record.cron_expression.as_deref(),
                record.interval_seconds,
                record.scheduled_at,
                None,
                now,
                self.tz,
            )?;
            self.store.set_schedule_active(id, true, next_run).await?;
            info!("Resumed schedule {}, next run {:?}", id, next_run);
        }
        self.require(id).await
    }

    /// Runs the schedule right away and waits for its execution record. The
    /// natural `next_run` is left alone.
    pub async fn execute_now(self: &Arc<Self>, id: &str) -> OrchResult<ExecutionRecord> {
        let record = self.require(id).await?;
        if !self.store.claim_schedule(id).await? {
            return Err(OrchestratorError::ScheduleBusy(id.to_string()));
        }
        let handle = self.dispatch(record, Trigger::Manual);
        handle
            .await
            .map_err(|e| OrchestratorError::Storage(anyhow::anyhow!("execution task failed: {}", e)))?
    }

    /// Cancels an in-flight execution (which still records its terminal
    /// outcome) before removing the schedule and its history.
    pub async fn delete(&self, id: &str) -> OrchResult<()> {
        self.require(id).await?;
        self.cancel_and_wait(id).await?;
        self.store.delete_schedule(id).await?;
        info!("Deleted schedule {}", id);
        Ok(())
    }

    /// Deletes every schedule of a host, waiting on in-flight executions.
    pub async fn delete_for_host(&self, host_id: &str) -> OrchResult<usize> {
        let schedules = self.store.list_schedules(host_id).await?;
        for schedule in &schedules {
            self.delete(&schedule.id).await?;
        }
        Ok(schedules.len())
    }

    /// A schedule can be claimed in the store a moment before its run handle
    /// exists, so the stored `running` flag is polled as well.
    async fn cancel_and_wait(&self, id: &str) -> OrchResult<()> {
        for _ in 0..DELETE_MAX_POLLS {
            let done = {
                let handles = self.handles();
                handles.get(id).map(|h| {
                    h.cancel.cancel();
                    h.done.clone()
                })
            };
            if let Some(mut done) = done {
                info!("Cancelling in-flight execution of schedule {}", id);
                let _ = done.wait_for(|finished| *finished).await;
                continue;
            }
            match self.store.get_schedule(id).await? {
                Some(schedule) if schedule.is_running => tokio::time::sleep(DELETE_POLL).await,
                _ => return Ok(()),
            }
        }
        warn!("Schedule {} stayed claimed, refusing to delete it", id);
        Err(OrchestratorError::ScheduleBusy(id.to_string()))
    }

    /// Resolves once no execution of `id` is in flight.
    #[cfg(test)]
    pub async fn wait_idle(&self, id: &str) {
        let done = self.handles().get(id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub async fn tick(self: &Arc<Self>) -> OrchResult<Vec<String>> {
        self.tick_at(Utc::now()).await
    }

    /// Claims every due schedule and spawns its execution. Never waits for
    /// the executions themselves.
    pub async fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> OrchResult<Vec<String>> {
        let due = self.store.due_schedules(now, self.batch_limit).await?;
        let mut dispatched = Vec::new();
        for schedule in due {
            if !self.store.claim_schedule(&schedule.id).await? {
                continue;
            }
            info!(
                "Dispatching schedule {} ({} {})",
                schedule.id, schedule.action, schedule.container_id
            );
            dispatched.push(schedule.id.clone());
            let _ = self.dispatch(schedule, Trigger::Scheduled);
        }
        Ok(dispatched)
    }

    /// Deletes execution history older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u32) -> OrchResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let removed = self.store.delete_executions_before(cutoff).await?;
        if removed > 0 {
            info!("Removed {} executions older than {} days", removed, retention_days);
        }
        Ok(removed)
    }

    /// Registers the run handle synchronously so `delete` can always find it,
    /// then spawns the execution. The schedule must already be claimed.
    fn dispatch(
        self: &Arc<Self>,
        schedule: ScheduleRecord,
        trigger: Trigger,
    ) -> JoinHandle<OrchResult<ExecutionRecord>> {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.handles().insert(
            schedule.id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let id = schedule.id.clone();
            let result = engine.run_claimed(schedule, trigger, cancel).await;
            if let Err(e) = &result {
                error!("Execution bookkeeping for schedule {} failed: {}", id, e);
                let _ = engine
                    .store
                    .finish_schedule_run(&id, Utc::now(), false, NextRun::Keep, false)
                    .await;
            }
            engine.handles().remove(&id);
            let _ = done_tx.send(true);
            result
        })
    }

    async fn run_claimed(
        &self,
        schedule: ScheduleRecord,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> OrchResult<ExecutionRecord> {
        let started_at = Utc::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptResult {
                outcome: ExecutionOutcome::Failure,
                attempts: 1,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error_message: Some("cancelled".to_string()),
            },
            result = self.attempt_all(&schedule) => result,
        };
        let completed_at = Utc::now();
        let succeeded = result.outcome == ExecutionOutcome::Success;

        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule.id.clone(),
            triggered_by: trigger.as_str().to_string(),
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            outcome: result.outcome,
            attempt_number: result.attempts,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            error_message: result.error_message,
        };
        self.store.insert_execution(&record).await?;

        let (next_run, deactivate) = match (trigger, schedule.schedule_type) {
            (Trigger::Manual, _) => (NextRun::Keep, false),
            (Trigger::Scheduled, ScheduleType::Once) => (NextRun::Set(None), true),
            (Trigger::Scheduled, kind) => {
                let next = next_run_after(
                    kind,
                    schedule.cron_expression.as_deref(),
                    schedule.interval_seconds,
                    schedule.scheduled_at,
                    Some(started_at),
                    completed_at,
                    self.tz,
                )?;
                (NextRun::Set(next), false)
            }
        };
        self.store
            .finish_schedule_run(&schedule.id, started_at, succeeded, next_run, deactivate)
            .await?;

        if succeeded {
            info!(
                "Schedule {} succeeded after {} attempt(s)",
                schedule.id, record.attempt_number
            );
        } else {
            warn!(
                "Schedule {} finished with {}: {}",
                schedule.id,
                record.outcome,
                record.error_message.as_deref().unwrap_or("")
            );
        }
        Ok(record)
    }

    /// One try plus `retry_count` retries, `retry_delay_seconds` apart.
    async fn attempt_all(&self, schedule: &ScheduleRecord) -> AttemptResult {
        let max_attempts = 1 + schedule.retry_count.max(0);
        let timeout = Duration::from_secs(schedule.timeout_seconds.max(1) as u64);
        let action = ContainerAction::from(schedule.action);

        let target = match self.targets.resolve(&schedule.host_id).await {
            Ok((_, target)) => target,
            Err(e) => {
                return AttemptResult {
                    outcome: ExecutionOutcome::Failure,
                    attempts: 1,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error_message: Some(e.to_string()),
                };
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut result = match self
                .supervisor
                .action(&target, &schedule.container_id, action, timeout)
                .await
            {
                Ok(out) if out.success() => AttemptResult {
                    outcome: ExecutionOutcome::Success,
                    attempts: attempt,
                    exit_code: Some(i64::from(out.exit_code)),
                    stdout: out.stdout,
                    stderr: out.stderr,
                    error_message: None,
                },
                Ok(out) => AttemptResult {
                    outcome: ExecutionOutcome::Failure,
                    attempts: attempt,
                    exit_code: Some(i64::from(out.exit_code)),
                    error_message: Some(format!("exit code {}: {}", out.exit_code, out.combined())),
                    stdout: out.stdout,
                    stderr: out.stderr,
                },
                Err(e) => AttemptResult {
                    outcome: match &e {
                        OrchestratorError::Remote(RemoteError::Timeout { .. }) => {
                            ExecutionOutcome::Timeout
                        }
                        _ => ExecutionOutcome::Failure,
                    },
                    attempts: attempt,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error_message: Some(e.to_string()),
                },
            };

            if result.outcome == ExecutionOutcome::Success {
                return result;
            }
            if attempt >= max_attempts {
                if max_attempts > 1 {
                    let message = result.error_message.take().unwrap_or_default();
                    result.error_message = Some(
                        OrchestratorError::ScheduleRetriesExhausted {
                            attempts: attempt as u32,
                            message,
                        }
                        .to_string(),
                    );
                }
                return result;
            }
            warn!(
                "Schedule {} attempt {}/{} failed: {}",
                schedule.id,
                attempt,
                max_attempts,
                result.error_message.as_deref().unwrap_or("")
            );
            tokio::time::sleep(Duration::from_secs(schedule.retry_delay_seconds.max(0) as u64))
                .await;
        }
    }
}
