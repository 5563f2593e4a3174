//! Timer-driven container actions: cron, fixed-interval and one-shot
//! schedules with retries and execution history.

mod cron;
mod engine;

pub use self::cron::CronExpr;
pub use self::engine::{ScheduleEngine, ScheduleRequest, ScheduleUpdate, next_run_after};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::Store;

/// Hooks the engine into the daemon lifecycle: clears running flags a crash
/// left behind, then registers the dispatcher tick and the daily history
/// cleanup on the shared job scheduler.
pub struct ScheduleComponent {
    engine: Arc<ScheduleEngine>,
    store: Store,
    scheduler: JobScheduler,
    tick: Duration,
    retention_days: u32,
}

impl ScheduleComponent {
    pub fn new(
        engine: Arc<ScheduleEngine>,
        store: Store,
        scheduler: JobScheduler,
        tick: Duration,
        retention_days: u32,
    ) -> Self {
        Self {
            engine,
            store,
            scheduler,
            tick,
            retention_days,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ScheduleComponent {
    async fn on_init(&mut self) -> Result<()> {
        let cleared = self.store.clear_stale_running().await?;
        if cleared > 0 {
            info!("Cleared {} stale running flags", cleared);
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let engine = self.engine.clone();
        let tick = Job::new_repeated_async(self.tick, move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                if let Err(e) = engine.tick().await {
                    error!("Schedule tick failed: {}", e);
                }
            })
        })?;
        self.scheduler.add(tick).await?;

        let engine = self.engine.clone();
        let retention_days = self.retention_days;
        let cleanup = Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                if let Err(e) = engine.cleanup(retention_days).await {
                    error!("Execution history cleanup failed: {}", e);
                }
            })
        })?;
        self.scheduler.add(cleanup).await?;

        info!(
            "Schedule engine started: tick every {}s, history kept {} days, timezone {}",
            self.tick.as_secs(),
            self.retention_days,
            self.engine.timezone()
        );
        Ok(())
    }
}
