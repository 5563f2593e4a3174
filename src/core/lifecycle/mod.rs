use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Start,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    /// Init every component, then start them in attach order, then start
    /// the job scheduler so registered jobs begin firing.
    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Start");
        self.state = LifecycleState::Start;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Job scheduler shutdown error: {}", e);
        }
        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("init {}", self.name));
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_run_in_phase_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new().await.unwrap();
        for name in ["store", "api"] {
            manager.attach(Arc::new(Mutex::new(Recorder {
                name,
                log: log.clone(),
            })));
        }
        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "init store",
                "init api",
                "start store",
                "start api",
                "stop api",
                "stop store"
            ]
        );
    }
}
