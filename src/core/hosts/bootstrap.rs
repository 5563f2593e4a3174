use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use super::service::HostService;
use crate::core::errors::{OrchResult, RemoteError};
use crate::core::remote::{CommandOutput, RemoteFs, RemoteTarget};
use crate::core::store::AuditEntry;
use crate::core::store::types::{AuditStatus, HostState};

/// Package installs can take minutes on a cold apt cache.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

const SYSTEM_INFO: &[(&str, &str)] = &[
    ("os_release", "cat /etc/os-release 2>/dev/null || echo Unknown"),
    ("kernel", "uname -r"),
    ("memory", "free -h | head -n 2"),
    ("disk", "df -h / | tail -n 1"),
    ("cpu", "nproc"),
    ("uptime", "uptime"),
];

const DOCKER_INSTALL: &str = "apt-get update && \
DEBIAN_FRONTEND=noninteractive apt-get install -y ca-certificates curl gnupg && \
install -m 0755 -d /etc/apt/keyrings && \
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | gpg --dearmor --yes -o /etc/apt/keyrings/docker.gpg && \
echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu $(. /etc/os-release && echo $VERSION_CODENAME) stable\" > /etc/apt/sources.list.d/docker.list && \
apt-get update && \
DEBIAN_FRONTEND=noninteractive apt-get install -y docker-ce docker-ce-cli containerd.io";

const NGINX_INSTALL: &str =
    "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y nginx";

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapStep {
    pub name: &'static str,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub task_id: String,
    pub success: bool,
    pub steps: Vec<BootstrapStep>,
    pub system_info: BTreeMap<String, String>,
    pub docker_version: Option<String>,
    pub nginx_version: Option<String>,
    pub error: Option<String>,
}

/// `PRETTY_NAME` from `/etc/os-release`, quotes stripped.
fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|l| l.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// Runs `command` with sudo unless the session already is root.
fn privileged(target: &RemoteTarget, command: &str) -> String {
    if target.username == "root" {
        command.to_string()
    } else {
        format!("sudo -n sh -c '{}'", command.replace('\'', r"'\''"))
    }
}

type StepResult = Result<String, String>;

fn describe(out: Result<CommandOutput, RemoteError>) -> StepResult {
    match out {
        Ok(out) if out.success() => Ok(out.combined()),
        Ok(out) => Err(format!("exit code {}: {}", out.exit_code, out.combined())),
        Err(e) => Err(e.to_string()),
    }
}

impl HostService {
    async fn run_step(&self, target: &RemoteTarget, command: &str, timeout: Duration) -> StepResult {
        describe(self.exec.run(target, command, timeout).await)
    }

    /// Installs the unit when `probe` fails, then makes sure it is enabled
    /// and running. Returns the version line reported by `probe`.
    async fn ensure_service(
        &self,
        target: &RemoteTarget,
        unit: &str,
        probe: &str,
        install: &str,
    ) -> StepResult {
        let timeout = self.command_timeout();
        if self.run_step(target, probe, timeout).await.is_err() {
            info!("{} missing on {}, installing", unit, target.address);
            self.run_step(target, &privileged(target, install), INSTALL_TIMEOUT)
                .await
                .map_err(|e| format!("{} install failed: {}", unit, e))?;
        }
        let enable = format!(
            "systemctl is-active --quiet {unit} || systemctl enable --now {unit}",
            unit = unit
        );
        self.run_step(target, &privileged(target, &enable), timeout)
            .await
            .map_err(|e| format!("{} did not start: {}", unit, e))?;
        self.run_step(target, probe, timeout)
            .await
            .map(|v| v.trim().to_string())
            .map_err(|e| format!("{} still unavailable after install: {}", unit, e))
    }

    async fn create_managed_dirs(&self, target: &RemoteTarget) -> StepResult {
        let fs = RemoteFs::new(self.exec.as_ref(), target, self.command_timeout());
        let dirs = [
            self.nginx.managed_dir.clone(),
            self.nginx.drafts_dir(),
            self.nginx.backup_dir.clone(),
        ];
        for dir in &dirs {
            fs.mkdir_p(dir).await.map_err(|e| e.to_string())?;
        }
        Ok(dirs.join(", "))
    }

    /// Prepares a host for management: records system facts, makes sure
    /// docker and nginx are installed and running, and creates the managed
    /// directories. The host ends `active`, or `error` naming the failed step.
    pub async fn bootstrap(&self, host_id: &str, actor: &str) -> OrchResult<BootstrapReport> {
        let (host, target) = self.targets.resolve(host_id).await?;
        let task_id = self
            .store
            .start_audit(&AuditEntry {
                action: "vps_bootstrap",
                resource_type: "host",
                resource_id: host_id,
                actor,
                description: format!("Bootstrapping {} ({})", host.name, host.address),
            })
            .await?;
        info!("Bootstrapping host {} ({})", host_id, host.address);

        let timeout = self.command_timeout();
        let mut system_info = BTreeMap::new();
        for (key, command) in SYSTEM_INFO {
            let value = self
                .run_step(&target, command, timeout)
                .await
                .unwrap_or_else(|e| format!("unavailable: {}", e));
            system_info.insert(key.to_string(), value);
        }

        let mut steps = vec![BootstrapStep {
            name: "system_info",
            success: true,
            output: format!("{} facts", system_info.len()),
        }];
        let mut nginx_version = None;
        let mut error = None;

        let docker = self
            .ensure_service(&target, "docker", "docker --version", DOCKER_INSTALL)
            .await;
        record(&mut steps, &mut error, "docker", &docker);
        let docker_version = docker.ok();

        if error.is_none() {
            let nginx = self
                .ensure_service(&target, "nginx", "nginx -v 2>&1", NGINX_INSTALL)
                .await;
            record(&mut steps, &mut error, "nginx", &nginx);
            nginx_version = nginx.ok();
        }
        if error.is_none() {
            let dirs = self.create_managed_dirs(&target).await;
            record(&mut steps, &mut error, "managed_dirs", &dirs);
        }

        let os_info = system_info.get("os_release").and_then(|r| pretty_name(r));
        self.store
            .update_host_facts(
                host_id,
                os_info.as_deref(),
                docker_version.as_deref(),
                nginx_version.as_deref(),
            )
            .await?;

        let success = error.is_none();
        if success {
            self.store.set_host_state(host_id, HostState::Active, None).await?;
            self.store.record_host_contact(host_id).await?;
            info!("Bootstrap of host {} complete", host_id);
        } else {
            let message = format!("bootstrap failed: {}", error.as_deref().unwrap_or(""));
            warn!("Host {}: {}", host_id, message);
            self.store
                .set_host_state(host_id, HostState::Error, Some(&message))
                .await?;
        }
        self.store
            .complete_audit(
                &task_id,
                if success { AuditStatus::Success } else { AuditStatus::Failed },
                error.as_deref(),
                &json!({ "steps": steps, "docker_version": docker_version, "nginx_version": nginx_version }),
            )
            .await?;

        Ok(BootstrapReport {
            task_id,
            success,
            steps,
            system_info,
            docker_version,
            nginx_version,
            error,
        })
    }
}

fn record(
    steps: &mut Vec<BootstrapStep>,
    error: &mut Option<String>,
    name: &'static str,
    result: &StepResult,
) {
    let (success, output) = match result {
        Ok(out) => (true, out.clone()),
        Err(e) => (false, e.clone()),
    };
    if !success && error.is_none() {
        *error = Some(format!("{}: {}", name, output));
    }
    steps.push(BootstrapStep {
        name,
        success,
        output,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hosts::service::tests::{harness, request};

    #[test]
    fn pretty_name_is_read_from_os_release() {
        let release = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04.1 LTS\"\nID=ubuntu\n";
        assert_eq!(pretty_name(release).as_deref(), Some("Ubuntu 24.04.1 LTS"));
        assert_eq!(pretty_name("ID=alpine"), None);
    }

    #[tokio::test]
    async fn bootstrap_on_ready_host_records_facts_and_dirs() {
        let h = harness();
        h.fake.on("cat /etc/os-release", CommandOutput::ok("PRETTY_NAME=\"Debian GNU/Linux 12\"\n"));
        h.fake.on("docker --version", CommandOutput::ok("Docker version 27.3.1\n"));
        h.fake.on("nginx -v", CommandOutput::ok("nginx version: nginx/1.24.0\n"));
        let mut req = request("203.0.113.30");
        req.bootstrap = true;

        let outcome = h.service.onboard(req, "ops").await.unwrap();
        let report = outcome.bootstrap.unwrap();
        assert!(report.success, "{:?}", report.error);
        assert_eq!(outcome.host.state, HostState::Active);
        assert_eq!(outcome.host.os_info.as_deref(), Some("Debian GNU/Linux 12"));
        assert_eq!(outcome.host.nginx_version.as_deref(), Some("nginx version: nginx/1.24.0"));
        assert_eq!(h.fake.count("apt-get install"), 0);
        assert_eq!(h.fake.count("mkdir -p"), 3);
        assert_eq!(h.fake.count("/srv/backups/nginx"), 1);
    }

    #[tokio::test]
    async fn missing_docker_is_installed() {
        let h = harness();
        h.fake.on_sequence(
            "docker --version",
            vec![
                CommandOutput::failed(127, "docker: command not found"),
                CommandOutput::ok("Docker version 27.3.1\n"),
            ],
        );
        let host = h.service.onboard(request("203.0.113.31"), "ops").await.unwrap().host;
        let report = h.service.bootstrap(&host.id, "ops").await.unwrap();
        assert!(report.success);
        assert_eq!(h.fake.count("docker-ce"), 1);
        assert_eq!(report.docker_version.as_deref(), Some("Docker version 27.3.1"));
    }

    #[tokio::test]
    async fn failed_install_marks_host_error_with_step() {
        let h = harness();
        h.fake.on("docker --version", CommandOutput::failed(127, "docker: command not found"));
        h.fake.on("docker-ce", CommandOutput::failed(100, "E: Unable to locate package"));
        let host = h.service.onboard(request("203.0.113.32"), "ops").await.unwrap().host;
        let report = h.service.bootstrap(&host.id, "ops").await.unwrap();
        assert!(!report.success);
        assert!(report.error.as_deref().unwrap().starts_with("docker:"));
        assert_eq!(h.fake.count("nginx -v"), 0);

        let stored = h.service.get(&host.id).await.unwrap();
        assert_eq!(stored.state, HostState::Error);
        assert!(stored.status_message.unwrap().contains("docker"));
    }

    #[test]
    fn non_root_sessions_use_sudo() {
        let mut target = crate::core::remote::fake::FakeExecutor::new().target();
        assert_eq!(privileged(&target, "systemctl reload nginx"), "systemctl reload nginx");
        target.username = "deploy".to_string();
        assert_eq!(
            privileged(&target, "echo 'x'"),
            r"sudo -n sh -c 'echo '\''x'\'''"
        );
    }
}
