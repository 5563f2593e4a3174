pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use chrono_tz::Tz;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::docker::DockerService;
use crate::core::hosts::{HostService, TargetResolver};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::nginx::{ApplyEngine, NginxService};
use crate::core::remote::RemoteExecutor;
use crate::core::schedule::ScheduleEngine;
use crate::core::store::Store;

pub use router::build_api_router;

/// Everything a request handler can reach. Cheap to clone.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Store,
    pub(crate) targets: TargetResolver,
    pub(crate) exec: Arc<dyn RemoteExecutor>,
    pub(crate) hosts: Arc<HostService>,
    pub(crate) nginx: Arc<NginxService>,
    pub(crate) apply: Arc<ApplyEngine>,
    pub(crate) docker: Arc<DockerService>,
    pub(crate) schedules: Arc<ScheduleEngine>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) timezone: Tz,
    pub(crate) command_timeout: Duration,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) api_token: Option<String>,
}

pub struct ApiServer {
    state: AppState,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub(crate) fn new(state: AppState) -> Self {
        Self {
            state,
            shutdown: CancellationToken::new(),
        }
    }
}

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    /// Binds before returning so a taken port fails startup instead of a
    /// background task.
    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.state.api_host, self.state.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server to {}", addr))?;
        let app = build_api_router(self.state.clone());
        let shutdown = self.shutdown.clone();

        info!("API Server running at http://{}", addr);
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
