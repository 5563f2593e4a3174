use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::OrchestratorConfig;
use crate::core::docker::{DockerService, DockerSupervisor};
use crate::core::hosts::{HostService, TargetResolver};
use crate::core::lifecycle::LifecycleManager;
use crate::core::nginx::{
    ApplyEngine, HostLocks, NginxService, SecretMasker, Validator, nginx_probe,
};
use crate::core::remote::{RemoteExecutor, SshExecutor};
use crate::core::schedule::{ScheduleComponent, ScheduleEngine};
use crate::core::store::Store;
use crate::core::terminal::{self, GuideSection};
use crate::core::vault::CredentialVault;
use crate::interfaces::web::{ApiServer, AppState};
use crate::logging::init_logging;
use crate::platform::{NativePlatform, Platform};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServeOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

/// Loads the config (explicit path or `<data_dir>/config.toml`) and applies
/// command-line overrides.
async fn resolve_config(opts: &ServeOptions, data_dir: &std::path::Path) -> Result<OrchestratorConfig> {
    let mut config = match &opts.config {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            OrchestratorConfig::load_file(path).await?
        }
        None => OrchestratorConfig::load(data_dir).await?,
    };
    if let Some(host) = &opts.host {
        config.api.host = host.clone();
    }
    if let Some(port) = opts.port {
        config.api.port = port;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run_serve(opts: ServeOptions) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    NativePlatform::restrict_dir_permissions(&data_dir);

    let config = resolve_config(&opts, &data_dir).await?;
    let log_tx = init_logging(&config.logging.level, opts.quiet);
    if !opts.quiet {
        terminal::print_banner();
    }
    info!("Starting vpsorch daemon (data dir {})", data_dir.display());

    let timezone = config.operating_timezone()?;
    let command_timeout = Duration::from_secs(config.ssh.command_timeout_secs);

    let store = Store::new(&data_dir).await?;
    if config.security.encryption_key.is_none() {
        info!("No security.encryption_key set, deriving the credential key from this machine");
    }
    let vault = Arc::new(CredentialVault::new(config.security.encryption_key.as_deref())?);
    let targets = TargetResolver::new(store.clone(), vault);
    let exec: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
        Duration::from_secs(config.ssh.connect_timeout_secs),
        data_dir.join("keys"),
    ));

    let validator = Arc::new(Validator::new(exec.clone(), command_timeout)?);
    let probe = nginx_probe(&config.nginx.health, exec.clone(), command_timeout)?;
    let supervisor = Arc::new(DockerSupervisor::new(exec.clone(), command_timeout));
    let schedules = Arc::new(ScheduleEngine::new(
        store.clone(),
        targets.clone(),
        supervisor.clone(),
        timezone,
        config.scheduler.due_batch_limit,
    ));
    let hosts = Arc::new(HostService::new(
        store.clone(),
        targets.clone(),
        exec.clone(),
        schedules.clone(),
        config.nginx.clone(),
        config.ssh.clone(),
    ));
    let nginx = Arc::new(NginxService::new(
        store.clone(),
        targets.clone(),
        validator.clone(),
        SecretMasker::new()?,
    ));
    let apply = Arc::new(ApplyEngine::new(
        store.clone(),
        exec.clone(),
        targets.clone(),
        validator,
        probe,
        HostLocks::new(),
        config.nginx.clone(),
        command_timeout,
    ));
    let docker = Arc::new(DockerService::new(store.clone(), targets.clone(), supervisor));

    let state = AppState {
        store: store.clone(),
        targets,
        exec,
        hosts,
        nginx,
        apply,
        docker,
        schedules: schedules.clone(),
        log_tx,
        timezone,
        command_timeout,
        api_host: config.api.host.clone(),
        api_port: config.api.port,
        api_token: config.api.token.clone(),
    };

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(ScheduleComponent::new(
        schedules,
        store,
        lifecycle.scheduler.clone(),
        Duration::from_secs(config.scheduler.tick_secs),
        config.scheduler.execution_retention_days,
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(state))));
    lifecycle.start().await?;

    if !opts.quiet {
        GuideSection::new("vpsorch is running")
            .status("Timezone", timezone.name())
            .status(
                "Auth",
                if config.api.token.is_some() {
                    "bearer token"
                } else {
                    "none (loopback only)"
                },
            )
            .blank()
            .text(&format!("Press {} to stop.", style("Ctrl+C").bold().yellow()))
            .print();
        terminal::print_link(
            "API",
            &format!("http://{}:{}/api", config.api.host, config.api.port),
        );
        println!();
    }

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    if !opts.quiet {
        terminal::print_goodbye();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[api]\nhost = \"0.0.0.0\"\nport = 9000\ntoken = \"t0k\"\n",
        )
        .unwrap();

        let from_file = resolve_config(&ServeOptions::default(), dir.path()).await.unwrap();
        assert_eq!(from_file.api.host, "0.0.0.0");
        assert_eq!(from_file.api.port, 9000);

        let opts = ServeOptions {
            port: Some(9100),
            ..Default::default()
        };
        let merged = resolve_config(&opts, dir.path()).await.unwrap();
        assert_eq!(merged.api.port, 9100);
        assert_eq!(merged.api.token.as_deref(), Some("t0k"));
    }

    #[tokio::test]
    async fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let opts = ServeOptions {
            config: Some(dir.path().join("absent.toml")),
            ..Default::default()
        };
        assert!(resolve_config(&opts, dir.path()).await.is_err());
    }
}
