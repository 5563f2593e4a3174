//! Container lifecycle on managed hosts, expressed as `docker` CLI calls
//! through the remote executor.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::errors::{OrchResult, OrchestratorError, RemoteError};
use crate::core::hosts::TargetResolver;
use crate::core::remote::{CommandOutput, RemoteExecutor, RemoteTarget};
use crate::core::store::types::{AuditStatus, ScheduleAction};
use crate::core::store::{AuditEntry, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Pause,
    Unpause,
    Remove,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Pause => "pause",
            ContainerAction::Unpause => "unpause",
            ContainerAction::Remove => "remove",
        }
    }

    /// The remote command for this action. `stop` and `remove` first clear
    /// the restart policy so the daemon does not bring the container back.
    fn command(&self, id: &str) -> String {
        let no_restart = format!("docker update --restart=no {} >/dev/null 2>&1", id);
        match self {
            ContainerAction::Start => format!("docker start {}", id),
            ContainerAction::Stop => format!("{}; docker stop {}", no_restart, id),
            ContainerAction::Restart => format!("docker restart {}", id),
            ContainerAction::Pause => format!("docker pause {}", id),
            ContainerAction::Unpause => format!("docker unpause {}", id),
            ContainerAction::Remove => format!(
                "{}; docker stop {} >/dev/null 2>&1; docker rm --force {}",
                no_restart, id, id
            ),
        }
    }
}

impl std::str::FromStr for ContainerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ContainerAction::Start),
            "stop" => Ok(ContainerAction::Stop),
            "restart" => Ok(ContainerAction::Restart),
            "pause" => Ok(ContainerAction::Pause),
            "unpause" => Ok(ContainerAction::Unpause),
            "remove" => Ok(ContainerAction::Remove),
            other => Err(format!("unknown container action '{}'", other)),
        }
    }
}

impl From<ScheduleAction> for ContainerAction {
    fn from(action: ScheduleAction) -> Self {
        match action {
            ScheduleAction::Start => ContainerAction::Start,
            ScheduleAction::Stop => ContainerAction::Stop,
            ScheduleAction::Restart => ContainerAction::Restart,
        }
    }
}

/// Container ids and names are interpolated into shell commands, so only
/// the characters docker itself allows get through.
pub fn validate_container_ref(id: &str) -> OrchResult<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "container reference '{}' must match [A-Za-z0-9_.-]+",
            id
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DockerStatus {
    /// `running`, `stopped` or `not_present`.
    pub status: String,
    pub daemon_running: bool,
    pub version: Option<String>,
    pub running_count: u32,
    pub total_count: u32,
    pub image_count: u32,
    pub system_info: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    pub created: String,
    pub ports: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Image {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub size: String,
    pub created: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "CreatedAt")]
    created_at: String,
    #[serde(rename = "Ports")]
    ports: String,
    #[serde(rename = "Labels")]
    labels: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImageLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "Size")]
    size: String,
    #[serde(rename = "CreatedSince")]
    created_since: String,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    split_list(raw)
        .into_iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Parses `docker ps --format '{{json .}}'`, one object per line.
/// Unparseable lines are skipped.
fn parse_containers(stdout: &str) -> Vec<Container> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<PsLine>(line) {
            Ok(ps) => Some(Container {
                id: ps.id.chars().take(12).collect(),
                name: ps.names.trim_start_matches('/').to_string(),
                image: ps.image,
                status: ps.status,
                state: ps.state,
                created: ps.created_at,
                ports: split_list(&ps.ports),
                labels: parse_labels(&ps.labels),
            }),
            Err(e) => {
                warn!("Skipping unparseable docker ps line: {}", e);
                None
            }
        })
        .collect()
}

fn parse_images(stdout: &str) -> Vec<Image> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<ImageLine>(line).ok())
        .map(|img| Image {
            id: img.id.trim_start_matches("sha256:").chars().take(12).collect(),
            repository: img.repository,
            tag: img.tag,
            size: img.size,
            created: img.created_since,
        })
        .collect()
}

fn parse_count(out: &CommandOutput) -> u32 {
    out.stdout.trim().parse().unwrap_or(0)
}

/// Thin translation of lifecycle actions and status queries into remote
/// docker calls. Safe for concurrent use against different containers.
pub struct DockerSupervisor {
    exec: Arc<dyn RemoteExecutor>,
    timeout: Duration,
}

impl DockerSupervisor {
    pub fn new(exec: Arc<dyn RemoteExecutor>, timeout: Duration) -> Self {
        Self { exec, timeout }
    }

    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<CommandOutput, RemoteError> {
        self.exec.run(target, command, self.timeout).await
    }

    /// A host without docker is a normal `not_present` status.
    pub async fn status(&self, target: &RemoteTarget) -> Result<DockerStatus, RemoteError> {
        let present = self
            .run(
                target,
                "command -v docker >/dev/null 2>&1 && echo present || echo absent",
            )
            .await?;
        if present.stdout.trim() != "present" {
            return Ok(DockerStatus {
                status: "not_present".to_string(),
                daemon_running: false,
                version: None,
                running_count: 0,
                total_count: 0,
                image_count: 0,
                system_info: json!({ "error": "Docker not installed on host" }),
            });
        }

        let version = self.run(target, "docker --version").await?;
        let daemon = self
            .run(
                target,
                "docker info >/dev/null 2>&1 && echo running || echo stopped",
            )
            .await?;
        let daemon_running = daemon.stdout.trim() == "running";
        let version = Some(version.stdout.trim().to_string()).filter(|v| !v.is_empty());

        if !daemon_running {
            return Ok(DockerStatus {
                status: "stopped".to_string(),
                daemon_running,
                version,
                running_count: 0,
                total_count: 0,
                image_count: 0,
                system_info: Value::Null,
            });
        }

        let info = self.run(target, "docker info --format '{{json .}}'").await?;
        let system_info = if info.success() {
            serde_json::from_str(info.stdout.trim())
                .unwrap_or_else(|_| json!({ "error": "Failed to parse docker info" }))
        } else {
            json!({ "error": info.combined() })
        };
        let running = self.run(target, "docker ps -q | wc -l").await?;
        let total = self.run(target, "docker ps -aq | wc -l").await?;
        let images = self.run(target, "docker images -q | wc -l").await?;

        Ok(DockerStatus {
            status: "running".to_string(),
            daemon_running,
            version,
            running_count: parse_count(&running),
            total_count: parse_count(&total),
            image_count: parse_count(&images),
            system_info,
        })
    }

    pub async fn list_containers(
        &self,
        target: &RemoteTarget,
        include_stopped: bool,
    ) -> OrchResult<Vec<Container>> {
        let flag = if include_stopped { " -a" } else { "" };
        let out = self
            .run(
                target,
                &format!("docker ps{} --no-trunc --format '{{{{json .}}}}'", flag),
            )
            .await?;
        if !out.success() {
            return Err(OrchestratorError::CommandFailed(out.combined()));
        }
        Ok(parse_containers(&out.stdout))
    }

    pub async fn list_images(&self, target: &RemoteTarget) -> OrchResult<Vec<Image>> {
        let out = self
            .run(target, "docker images --format '{{json .}}'")
            .await?;
        if !out.success() {
            return Err(OrchestratorError::CommandFailed(out.combined()));
        }
        Ok(parse_images(&out.stdout))
    }

    /// Runs one lifecycle action with an explicit timeout. A non-zero exit
    /// is returned as output, not as an error.
    pub async fn action(
        &self,
        target: &RemoteTarget,
        container_id: &str,
        action: ContainerAction,
        timeout: Duration,
    ) -> OrchResult<CommandOutput> {
        validate_container_ref(container_id)?;
        info!(
            "docker {} {} on {}",
            action.as_str(),
            container_id,
            target.address
        );
        let out = self
            .exec
            .run(target, &action.command(container_id), timeout)
            .await?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub task_id: String,
    pub container_id: String,
    pub action: ContainerAction,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Host-addressed docker operations for the API, with audit records for
/// every lifecycle action.
pub struct DockerService {
    store: Store,
    targets: TargetResolver,
    supervisor: Arc<DockerSupervisor>,
}

impl DockerService {
    pub fn new(store: Store, targets: TargetResolver, supervisor: Arc<DockerSupervisor>) -> Self {
        Self {
            store,
            targets,
            supervisor,
        }
    }

    pub async fn status(&self, host_id: &str) -> OrchResult<DockerStatus> {
        let (_, target) = self.targets.resolve(host_id).await?;
        Ok(self.supervisor.status(&target).await?)
    }

    pub async fn containers(&self, host_id: &str, include_stopped: bool) -> OrchResult<Vec<Container>> {
        let (_, target) = self.targets.resolve(host_id).await?;
        self.supervisor.list_containers(&target, include_stopped).await
    }

    pub async fn images(&self, host_id: &str) -> OrchResult<Vec<Image>> {
        let (_, target) = self.targets.resolve(host_id).await?;
        self.supervisor.list_images(&target).await
    }

    /// `remove` is destructive; confirming intent is the caller's job.
    pub async fn action(
        &self,
        host_id: &str,
        container_id: &str,
        action: ContainerAction,
        actor: &str,
        timeout: Duration,
    ) -> OrchResult<ActionReport> {
        validate_container_ref(container_id)?;
        let (_, target) = self.targets.resolve(host_id).await?;
        let action_name = format!("docker_container_{}", action.as_str());
        let task_id = self
            .store
            .start_audit(&AuditEntry {
                action: &action_name,
                resource_type: "docker",
                resource_id: host_id,
                actor,
                description: format!("docker {} on container {}", action.as_str(), container_id),
            })
            .await?;

        let result = self
            .supervisor
            .action(&target, container_id, action, timeout)
            .await;
        let details = json!({ "container_id": container_id, "action": action.as_str() });
        let (status, error) = match &result {
            Ok(out) if out.success() => (AuditStatus::Success, None),
            Ok(out) => (AuditStatus::Failed, Some(out.combined())),
            Err(e) => (AuditStatus::Failed, Some(e.to_string())),
        };
        self.store
            .complete_audit(&task_id, status, error.as_deref(), &details)
            .await?;

        let out = result?;
        Ok(ActionReport {
            task_id,
            container_id: container_id.to_string(),
            action,
            success: out.success(),
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hosts::test_resolver;
    use crate::core::remote::fake::FakeExecutor;

    const PS_OUTPUT: &str = r#"{"Command":"\"/entrypoint.sh\"","CreatedAt":"2025-01-01 10:00:00 +0000 UTC","ID":"4f1c2b3a9d8e7f6a5b4c3d2e1f0a","Image":"odoo:17","Labels":"com.docker.compose.project=erp,maintainer=ops","Names":"erp-odoo-1","Ports":"0.0.0.0:8069->8069/tcp, 8072/tcp","State":"running","Status":"Up 3 hours"}
not json
{"ID":"aa11bb22cc33dd44","Names":"db","Image":"postgres:16","State":"exited","Status":"Exited (0) 2 days ago"}
"#;

    #[test]
    fn ps_lines_parse_into_containers() {
        let containers = parse_containers(PS_OUTPUT);
        assert_eq!(containers.len(), 2);
        let odoo = &containers[0];
        assert_eq!(odoo.id, "4f1c2b3a9d8e");
        assert_eq!(odoo.name, "erp-odoo-1");
        assert_eq!(odoo.ports, vec!["0.0.0.0:8069->8069/tcp", "8072/tcp"]);
        assert_eq!(odoo.labels.get("com.docker.compose.project").unwrap(), "erp");
        assert_eq!(containers[1].state, "exited");
        assert!(containers[1].labels.is_empty());
    }

    #[test]
    fn container_refs_reject_shell_metacharacters() {
        assert!(validate_container_ref("erp-odoo-1").is_ok());
        assert!(validate_container_ref("4f1c2b3a9d8e").is_ok());
        assert!(validate_container_ref("web; rm -rf /").is_err());
        assert!(validate_container_ref("$(id)").is_err());
        assert!(validate_container_ref("--help").is_err());
    }

    #[test]
    fn stop_and_remove_disable_restart_policy_first() {
        let stop = ContainerAction::Stop.command("web");
        assert!(stop.starts_with("docker update --restart=no web"));
        assert!(stop.ends_with("docker stop web"));
        let remove = ContainerAction::Remove.command("web");
        assert!(remove.ends_with("docker rm --force web"));
        assert_eq!("unpause".parse::<ContainerAction>().unwrap(), ContainerAction::Unpause);
    }

    #[tokio::test]
    async fn missing_docker_is_not_present_not_an_error() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("command -v docker", CommandOutput::ok("absent\n"));
        let supervisor = DockerSupervisor::new(fake.clone(), Duration::from_secs(5));
        let status = supervisor.status(&fake.target()).await.unwrap();
        assert_eq!(status.status, "not_present");
        assert!(!status.daemon_running);
        assert_eq!(fake.count("docker ps"), 0);
    }

    #[tokio::test]
    async fn running_daemon_reports_counts() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("command -v docker", CommandOutput::ok("present\n"));
        fake.on("docker --version", CommandOutput::ok("Docker version 27.3.1, build ce12230\n"));
        fake.on("echo running", CommandOutput::ok("running\n"));
        fake.on("docker info --format", CommandOutput::ok("{\"ServerVersion\":\"27.3.1\"}"));
        fake.on("docker ps -q", CommandOutput::ok("2\n"));
        fake.on("docker ps -aq", CommandOutput::ok("5\n"));
        fake.on("docker images -q", CommandOutput::ok("7\n"));
        let supervisor = DockerSupervisor::new(fake.clone(), Duration::from_secs(5));
        let status = supervisor.status(&fake.target()).await.unwrap();
        assert_eq!(status.status, "running");
        assert_eq!(
            (status.running_count, status.total_count, status.image_count),
            (2, 5, 7)
        );
        assert_eq!(status.system_info["ServerVersion"], "27.3.1");
        assert_eq!(status.version.as_deref(), Some("Docker version 27.3.1, build ce12230"));
    }

    #[tokio::test]
    async fn actions_are_audited_with_outcome() {
        let store = Store::in_memory().unwrap();
        let (targets, host) = test_resolver(&store).await;
        let fake = Arc::new(FakeExecutor::new());
        fake.on("docker restart web", CommandOutput::failed(1, "No such container: web"));
        let supervisor = Arc::new(DockerSupervisor::new(fake.clone(), Duration::from_secs(5)));
        let service = DockerService::new(store.clone(), targets, supervisor);

        let report = service
            .action(&host.id, "web", ContainerAction::Restart, "ops", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!report.success);
        let audit = store.get_audit(&report.task_id).await.unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Failed);
        assert_eq!(audit.action, "docker_container_restart");

        let err = service
            .action(&host.id, "web;id", ContainerAction::Start, "ops", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(fake.count("docker start"), 0);
    }
}
