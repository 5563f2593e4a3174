use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Replaced by the host address in `[nginx.health] http_url`.
pub const ADDRESS_PLACEHOLDER: &str = "{address}";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub nginx: NginxConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on every API call when set.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Consecutive authentication failures before a host is parked in
    /// `requires_manual_intervention`.
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NginxConfig {
    #[serde(default = "default_managed_dir")]
    pub managed_dir: String,

    #[serde(default = "default_sites_enabled_dir")]
    pub sites_enabled_dir: String,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,

    #[serde(default = "default_watch_window")]
    pub watch_window_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    #[serde(default)]
    pub health: HealthProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthProbeConfig {
    /// `"process"` (service active + control port listening) or `"http"`.
    #[serde(default = "default_probe_kind")]
    pub kind: String,

    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// e.g. `http://{address}/healthz`; required for `"http"`.
    #[serde(default)]
    pub http_url: Option<String>,

    #[serde(default = "default_max_journal_errors")]
    pub max_journal_errors: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    #[serde(default = "default_due_batch_limit")]
    pub due_batch_limit: u32,

    #[serde(default = "default_execution_retention_days")]
    pub execution_retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    17890
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    30
}
fn default_auth_failure_threshold() -> u32 {
    3
}
fn default_managed_dir() -> String {
    "/etc/nginx/managed.d".to_string()
}
fn default_sites_enabled_dir() -> String {
    "/etc/nginx/sites-enabled".to_string()
}
fn default_backup_dir() -> String {
    "/srv/backups/nginx".to_string()
}
fn default_watch_window() -> u64 {
    120
}
fn default_health_interval() -> u64 {
    5
}
fn default_probe_kind() -> String {
    "process".to_string()
}
fn default_control_port() -> u16 {
    80
}
fn default_max_journal_errors() -> u32 {
    10
}
fn default_timezone() -> String {
    "Asia/Dhaka".to_string()
}
fn default_tick() -> u64 {
    30
}
fn default_due_batch_limit() -> u32 {
    50
}
fn default_execution_retention_days() -> u32 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            token: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            auth_failure_threshold: default_auth_failure_threshold(),
        }
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            managed_dir: default_managed_dir(),
            sites_enabled_dir: default_sites_enabled_dir(),
            backup_dir: default_backup_dir(),
            watch_window_secs: default_watch_window(),
            health_interval_secs: default_health_interval(),
            health: HealthProbeConfig::default(),
        }
    }
}

impl NginxConfig {
    /// Staging area for candidates, on the same filesystem as the live files
    /// so the final rename is atomic.
    pub fn drafts_dir(&self) -> String {
        format!("{}/drafts", self.managed_dir.trim_end_matches('/'))
    }
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            kind: default_probe_kind(),
            control_port: default_control_port(),
            http_url: None,
            max_journal_errors: default_max_journal_errors(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            tick_secs: default_tick(),
            due_batch_limit: default_due_batch_limit(),
            execution_retention_days: default_execution_retention_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl OrchestratorConfig {
    /// Reads `<data_dir>/config.toml`, falling back to defaults when absent.
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        Self::load_file(&config_path).await
    }

    pub async fn load_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!(
                "No {} found, using default settings.",
                config_path.display()
            );
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(config_path).await?;
        let config: OrchestratorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        config.validate()?;

        info!(
            "Loaded config: api={}:{}, timezone={}, watch_window={}s, tick={}s",
            config.api.host,
            config.api.port,
            config.scheduler.timezone,
            config.nginx.watch_window_secs,
            config.scheduler.tick_secs
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.operating_timezone()?;
        if self.scheduler.tick_secs == 0 {
            anyhow::bail!("scheduler.tick_secs must be greater than zero");
        }
        if self.nginx.health_interval_secs == 0 {
            anyhow::bail!("nginx.health_interval_secs must be greater than zero");
        }
        if self.ssh.command_timeout_secs == 0 || self.ssh.connect_timeout_secs == 0 {
            anyhow::bail!("ssh timeouts must be greater than zero");
        }
        match self.nginx.health.kind.as_str() {
            "process" => {}
            "http" => match self.nginx.health.http_url.as_deref() {
                Some(url) if url.contains(ADDRESS_PLACEHOLDER) => {}
                Some(url) => anyhow::bail!(
                    "nginx.health.http_url '{}' must contain {} so each host is probed at its own address",
                    url,
                    ADDRESS_PLACEHOLDER
                ),
                None => anyhow::bail!("nginx.health.kind = \"http\" requires nginx.health.http_url"),
            },
            other => anyhow::bail!("Unknown nginx.health.kind '{}'", other),
        }
        Ok(())
    }

    pub fn operating_timezone(&self) -> Result<chrono_tz::Tz> {
        self.scheduler
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid scheduler.timezone: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.api.port, 17890);
        assert_eq!(config.ssh.command_timeout_secs, 30);
        assert_eq!(config.nginx.watch_window_secs, 120);
        assert_eq!(config.scheduler.timezone, "Asia/Dhaka");
        assert_eq!(config.scheduler.due_batch_limit, 50);
        assert_eq!(config.nginx.drafts_dir(), "/etc/nginx/managed.d/drafts");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [api]
            port = 9000

            [scheduler]
            timezone = "Europe/Berlin"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.scheduler.tick_secs, 30);
        assert_eq!(
            config.operating_timezone().unwrap(),
            chrono_tz::Europe::Berlin
        );
    }

    #[test]
    fn validate_rejects_bad_timezone_and_http_probe_without_url() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.nginx.health.kind = "http".to_string();
        assert!(config.validate().is_err());
        config.nginx.health.http_url = Some("http://10.0.0.5/".to_string());
        assert!(config.validate().is_err());
        config.nginx.health.http_url = Some("http://{address}/healthz".to_string());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.api.port, 17890);
    }

    #[tokio::test]
    async fn load_reads_file_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[nginx]\nwatch_window_secs = 15\n",
        )
        .await
        .unwrap();
        let config = OrchestratorConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.nginx.watch_window_secs, 15);
        assert_eq!(config.nginx.managed_dir, "/etc/nginx/managed.d");
    }
}
