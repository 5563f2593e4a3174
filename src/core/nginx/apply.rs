use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::health::{HealthProbe, HealthSample};
use super::locks::{HostLockGuard, HostLocks};
use super::validator::{ValidationResult, Validator};
use crate::core::config::NginxConfig;
use crate::core::errors::{OrchResult, OrchestratorError, RemoteError};
use crate::core::hosts::TargetResolver;
use crate::core::remote::{RemoteExecutor, RemoteFs, RemoteTarget};
use crate::core::store::types::{AuditStatus, ConfigStatus, ConfigVersionRecord, HostState};
use crate::core::store::{AuditEntry, Store};

const RELOAD_COMMAND: &str = "nginx -t 2>&1 && systemctl reload nginx";

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub config_id: String,
    pub dry_run: bool,
    pub watch_window: Option<Duration>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub task_id: String,
    pub host_id: String,
    pub config_id: String,
    pub version: i64,
    pub status: ConfigStatus,
    pub dry_run: bool,
    pub rolled_back: bool,
    pub message: String,
    pub warning: Option<String>,
    pub validation: Option<ValidationResult>,
    pub health_samples: usize,
}

/// An apply that holds its host lock and has an open audit task, ready to
/// run now or on a background task.
pub struct PreparedApply {
    _guard: HostLockGuard,
    target: RemoteTarget,
    version: ConfigVersionRecord,
    task_id: String,
    request: ApplyRequest,
}

impl PreparedApply {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn version(&self) -> &ConfigVersionRecord {
        &self.version
    }
}

/// Where one config lives on the host while it is swapped in.
struct SwapPlan {
    draft: String,
    live: String,
    link: String,
    backup: Option<String>,
    link_existed: bool,
}

/// Drives draft → staged → watching → applied, rolling back on a failed
/// reload or a negative health sample. One sequence per host at a time.
pub struct ApplyEngine {
    store: Store,
    exec: Arc<dyn RemoteExecutor>,
    targets: TargetResolver,
    validator: Arc<Validator>,
    probe: Arc<dyn HealthProbe>,
    locks: HostLocks,
    nginx: NginxConfig,
    command_timeout: Duration,
}

impl ApplyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        exec: Arc<dyn RemoteExecutor>,
        targets: TargetResolver,
        validator: Arc<Validator>,
        probe: Arc<dyn HealthProbe>,
        locks: HostLocks,
        nginx: NginxConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            store,
            exec,
            targets,
            validator,
            probe,
            locks,
            nginx,
            command_timeout,
        }
    }

    pub fn default_watch_window(&self) -> Duration {
        Duration::from_secs(self.nginx.watch_window_secs)
    }

    fn fs<'a>(&'a self, target: &'a RemoteTarget) -> RemoteFs<'a> {
        RemoteFs::new(self.exec.as_ref(), target, self.command_timeout)
    }

    /// Resolves the version, claims the host lock (`HostBusy` when taken) and
    /// opens the audit task.
    pub async fn prepare(&self, request: ApplyRequest) -> OrchResult<PreparedApply> {
        let version = self
            .store
            .get_config_version_by_id(&request.config_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("config version {}", request.config_id))
            })?;
        let (_, target) = self.targets.resolve(&version.host_id).await?;
        let guard = self.locks.try_acquire(&version.host_id)?;

        if version.is_active && version.status == ConfigStatus::Applied && !request.dry_run {
            return Err(OrchestratorError::Conflict(format!(
                "version {} is already active",
                version.version
            )));
        }

        let action = if request.dry_run {
            "nginx_config_dry_run"
        } else {
            "nginx_config_apply"
        };
        let task_id = self
            .store
            .start_audit(&AuditEntry {
                action,
                resource_type: "nginx",
                resource_id: &version.host_id,
                actor: &request.actor,
                description: format!(
                    "Applying nginx config version {} ({})",
                    version.version, version.config_name
                ),
            })
            .await?;

        Ok(PreparedApply {
            _guard: guard,
            target,
            version,
            task_id,
            request,
        })
    }

    pub async fn apply(&self, request: ApplyRequest) -> OrchResult<ApplyOutcome> {
        let prepared = self.prepare(request).await?;
        self.run(prepared).await
    }

    /// Runs a prepared apply to completion. The host lock is released when
    /// this returns.
    pub async fn run(&self, prepared: PreparedApply) -> OrchResult<ApplyOutcome> {
        let result = self.execute(&prepared).await;
        self.finish_audit(&prepared.task_id, &result).await;
        result
    }

    async fn execute(&self, prepared: &PreparedApply) -> OrchResult<ApplyOutcome> {
        let version = &prepared.version;
        let target = &prepared.target;
        let host_id = version.host_id.as_str();
        let mut outcome = ApplyOutcome {
            task_id: prepared.task_id.clone(),
            host_id: host_id.to_string(),
            config_id: version.id.clone(),
            version: version.version,
            status: version.status,
            dry_run: prepared.request.dry_run,
            rolled_back: false,
            message: String::new(),
            warning: None,
            validation: None,
            health_samples: 0,
        };

        // 1. Validate the exact bytes being shipped.
        let validation = self.validator.preview(target, &version.content).await?;
        self.store
            .set_config_validation(&version.id, &serde_json::to_string(&validation)?)
            .await?;
        if !validation.is_valid {
            let first = validation.errors.first().cloned().unwrap_or_default();
            self.store
                .record_config_failure(
                    host_id,
                    &version.id,
                    &format!("validation failed: {}", first),
                    false,
                    None,
                )
                .await?;
            warn!(
                "Config v{} for host {} failed validation: {}",
                version.version, host_id, first
            );
            outcome.status = ConfigStatus::Failed;
            outcome.message = format!("validation failed: {}", first);
            outcome.validation = Some(validation);
            return Ok(outcome);
        }
        outcome.validation = Some(validation);

        // 2. Dry run stops here; nothing on the host changed.
        if prepared.request.dry_run {
            outcome.status = ConfigStatus::Staged;
            outcome.message = "validation passed; dry run left the live configuration untouched"
                .to_string();
            return Ok(outcome);
        }

        // 3. Snapshot what is active before anything moves.
        let prior_active = self
            .store
            .get_host(host_id)
            .await?
            .and_then(|h| h.active_config_id);
        self.store
            .set_config_status(&version.id, ConfigStatus::Staged)
            .await?;

        let result = self
            .execute_staged(prepared, prior_active.as_deref(), outcome)
            .await;
        if let Err(e) = &result {
            self.settle_unfinished(version, prior_active.as_deref(), e).await;
        }
        result
    }

    /// Steps 4-7. Any early error leaves the version non-terminal; the caller
    /// settles it.
    async fn execute_staged(
        &self,
        prepared: &PreparedApply,
        prior_active: Option<&str>,
        mut outcome: ApplyOutcome,
    ) -> OrchResult<ApplyOutcome> {
        let version = &prepared.version;
        let target = &prepared.target;
        let host_id = version.host_id.as_str();

        // 4. Swap the candidate in.
        let plan = self.backup_live(target, version).await?;
        if let Err(e) = self.swap_in(target, version, &plan).await {
            error!("Swap of v{} on host {} failed: {}", version.version, host_id, e);
            self.restore_or_escalate(
                target,
                version,
                &plan,
                prior_active,
                &e.to_string(),
                false,
            )
            .await?;
            self.store
                .record_config_failure(host_id, &version.id, &e.to_string(), false, None)
                .await?;
            return Err(e.into());
        }

        // 5. Reload; a failure here restores the previous file immediately.
        if let Err(message) = self.reload(target).await {
            error!(
                "Reload after v{} on host {} failed: {}",
                version.version, host_id, message
            );
            self.restore_or_escalate(
                target,
                version,
                &plan,
                prior_active,
                &message,
                false,
            )
            .await?;
            self.store
                .record_config_failure(
                    host_id,
                    &version.id,
                    &format!("reload failed: {}", message),
                    false,
                    None,
                )
                .await?;
            return Err(OrchestratorError::ReloadFailed(message));
        }

        // 6. Watch.
        self.store.begin_config_watch(host_id, &version.id).await?;
        let window = prepared
            .request
            .watch_window
            .unwrap_or_else(|| self.default_watch_window());
        info!(
            "Config v{} live on host {}, watching for {}s",
            version.version,
            host_id,
            window.as_secs()
        );
        let (samples, watched) = self.watch(target, window).await;
        outcome.health_samples = samples;

        match watched {
            Ok(details) => {
                // 7. Commit.
                self.store
                    .commit_config_applied(host_id, &version.id, Some(&details.to_string()), None)
                    .await?;
                info!(
                    "Config v{} applied on host {} after {} healthy samples",
                    version.version, host_id, samples
                );
                outcome.status = ConfigStatus::Applied;
                outcome.message = format!("version {} applied", version.version);
                Ok(outcome)
            }
            Err(sample) => {
                let reason = sample
                    .reason
                    .clone()
                    .unwrap_or_else(|| "negative health sample".to_string());
                warn!(
                    "Health degraded on host {} during watch of v{}: {}",
                    host_id, version.version, reason
                );
                self.restore_or_escalate(
                    target,
                    version,
                    &plan,
                    prior_active,
                    &reason,
                    true,
                )
                .await?;
                let reason = format!("health degraded: {}", reason);
                self.store
                    .record_config_rollback(
                        host_id,
                        &version.id,
                        &reason,
                        Some(&sample.details.to_string()),
                        prior_active,
                    )
                    .await?;
                self.store
                    .log_audit(
                        &AuditEntry {
                            action: "nginx_config_auto_rollback",
                            resource_type: "nginx",
                            resource_id: host_id,
                            actor: "system",
                            description: format!(
                                "Rolled back nginx config version {}",
                                version.version
                            ),
                        },
                        AuditStatus::Success,
                        None,
                        &json!({ "task_id": prepared.task_id, "reason": reason }),
                    )
                    .await?;
                outcome.status = ConfigStatus::RolledBack;
                outcome.rolled_back = true;
                outcome.message = format!(
                    "version {} rolled back, previous configuration restored",
                    version.version
                );
                outcome.warning = Some(reason);
                Ok(outcome)
            }
        }
    }

    /// Re-applies an earlier version without a watch window. Defaults to the
    /// newest applied version other than the active one.
    pub async fn revert(
        &self,
        host_id: &str,
        target_version: Option<i64>,
        actor: &str,
    ) -> OrchResult<ApplyOutcome> {
        let (host, target) = self.targets.resolve(host_id).await?;
        let _guard = self.locks.try_acquire(host_id)?;
        let active = host.active_config_id.clone();

        let version = match target_version {
            Some(v) => self.store.get_config_version(host_id, v).await?.ok_or_else(|| {
                OrchestratorError::NotFound(format!("version {} of host {}", v, host_id))
            })?,
            None => self
                .store
                .last_applied_version(host_id, active.as_deref())
                .await?
                .ok_or_else(|| {
                    OrchestratorError::NotFound(format!(
                        "an earlier applied version for host {}",
                        host_id
                    ))
                })?,
        };
        if active.as_deref() == Some(version.id.as_str()) {
            return Err(OrchestratorError::Conflict(format!(
                "version {} is already active",
                version.version
            )));
        }

        let task_id = self
            .store
            .start_audit(&AuditEntry {
                action: "nginx_config_revert",
                resource_type: "nginx",
                resource_id: host_id,
                actor,
                description: format!("Reverting nginx config to version {}", version.version),
            })
            .await?;
        let result = self
            .execute_revert(&target, &version, active.as_deref(), &task_id)
            .await;
        self.finish_audit(&task_id, &result).await;
        result
    }

    async fn execute_revert(
        &self,
        target: &RemoteTarget,
        version: &ConfigVersionRecord,
        active: Option<&str>,
        task_id: &str,
    ) -> OrchResult<ApplyOutcome> {
        let host_id = version.host_id.as_str();
        let validation = self.validator.preview(target, &version.content).await?;
        if !validation.is_valid {
            return Err(OrchestratorError::InvalidInput(format!(
                "version {} no longer validates: {}",
                version.version,
                validation.errors.join("; ")
            )));
        }

        let plan = self.backup_live(target, version).await?;
        if let Err(e) = self.swap_in(target, version, &plan).await {
            self.restore_or_escalate(target, version, &plan, active, &e.to_string(), false)
                .await?;
            return Err(e.into());
        }
        if let Err(message) = self.reload(target).await {
            self.restore_or_escalate(target, version, &plan, active, &message, false)
                .await?;
            return Err(OrchestratorError::ReloadFailed(message));
        }

        let reason = format!("reverted to version {}", version.version);
        self.store
            .commit_config_applied(
                host_id,
                &version.id,
                None,
                active.map(|id| (id, reason.as_str())),
            )
            .await?;
        info!("Host {} reverted to config v{}", host_id, version.version);

        Ok(ApplyOutcome {
            task_id: task_id.to_string(),
            host_id: host_id.to_string(),
            config_id: version.id.clone(),
            version: version.version,
            status: ConfigStatus::Applied,
            dry_run: false,
            rolled_back: false,
            message: reason,
            warning: None,
            validation: Some(validation),
            health_samples: 0,
        })
    }

    fn plan_for(&self, version: &ConfigVersionRecord) -> SwapPlan {
        let managed = self.nginx.managed_dir.trim_end_matches('/');
        SwapPlan {
            draft: format!(
                "{}/{}_v{}.conf",
                self.nginx.drafts_dir(),
                version.config_name,
                version.version
            ),
            live: format!("{}/{}.conf", managed, version.config_name),
            link: format!(
                "{}/{}.conf",
                self.nginx.sites_enabled_dir.trim_end_matches('/'),
                version.config_name
            ),
            backup: None,
            link_existed: false,
        }
    }

    /// Copies the current live file aside. Nothing live changes here.
    async fn backup_live(
        &self,
        target: &RemoteTarget,
        version: &ConfigVersionRecord,
    ) -> Result<SwapPlan, RemoteError> {
        let fs = self.fs(target);
        let mut plan = self.plan_for(version);
        let backup_dir = self.nginx.backup_dir.trim_end_matches('/');

        fs.mkdir_p(&self.nginx.drafts_dir()).await?;
        fs.mkdir_p(backup_dir).await?;
        if fs.exists(&plan.live).await? {
            let backup = format!(
                "{}/{}.{}.conf",
                backup_dir,
                version.config_name,
                Utc::now().format("%Y%m%dT%H%M%S%3f")
            );
            fs.copy(&plan.live, &backup).await?;
            plan.backup = Some(backup);
        }
        plan.link_existed = fs.exists(&plan.link).await?;
        Ok(plan)
    }

    /// Write-then-rename into the live path, then enable it.
    async fn swap_in(
        &self,
        target: &RemoteTarget,
        version: &ConfigVersionRecord,
        plan: &SwapPlan,
    ) -> Result<(), RemoteError> {
        let fs = self.fs(target);
        fs.write(&plan.draft, &version.content).await?;
        fs.rename(&plan.draft, &plan.live).await?;
        fs.symlink(&plan.live, &plan.link).await?;
        Ok(())
    }

    /// Puts back whatever was live before the swap: the backup, or nothing.
    async fn restore(&self, target: &RemoteTarget, plan: &SwapPlan) -> Result<(), RemoteError> {
        let fs = self.fs(target);
        match &plan.backup {
            Some(backup) => {
                let staged = format!("{}.restore", plan.live);
                fs.copy(backup, &staged).await?;
                fs.rename(&staged, &plan.live).await?;
            }
            None => {
                fs.remove(&plan.live).await?;
                if !plan.link_existed {
                    fs.remove(&plan.link).await?;
                }
            }
        }
        fs.remove(&plan.draft).await
    }

    async fn reload(&self, target: &RemoteTarget) -> Result<(), String> {
        match self
            .exec
            .run(target, RELOAD_COMMAND, self.command_timeout)
            .await
        {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.combined()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Restores the previous configuration (reloading when the candidate was
    /// already serving). If that fails too the host is parked for an operator.
    async fn restore_or_escalate(
        &self,
        target: &RemoteTarget,
        version: &ConfigVersionRecord,
        plan: &SwapPlan,
        prior_active: Option<&str>,
        cause: &str,
        reload_after: bool,
    ) -> OrchResult<()> {
        let host_id = version.host_id.as_str();
        let restored = match self.restore(target, plan).await {
            Ok(()) if reload_after => self.reload(target).await,
            Ok(()) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        let Err(failure) = restored else {
            info!("Previous nginx configuration restored on host {}", host_id);
            return Ok(());
        };

        let message = format!("{}; restore failed: {}", cause, failure);
        error!(
            "Rollback of v{} on host {} failed, manual intervention required: {}",
            version.version, host_id, message
        );
        self.store
            .record_config_failure(host_id, &version.id, &message, true, Some(prior_active))
            .await?;
        self.store
            .set_host_state(
                host_id,
                HostState::RequiresManualIntervention,
                Some(&format!("nginx rollback failed: {}", failure)),
            )
            .await?;
        Err(OrchestratorError::RollbackFailed(message))
    }

    /// Samples at the configured cadence until the window closes. Returns
    /// the number of samples and either the last healthy details or the
    /// first negative sample.
    async fn watch(
        &self,
        target: &RemoteTarget,
        window: Duration,
    ) -> (usize, Result<Value, HealthSample>) {
        let interval = Duration::from_secs(self.nginx.health_interval_secs.max(1));
        let started = Instant::now();
        let mut samples = 0;
        loop {
            let sample = self.probe.sample(target).await;
            samples += 1;
            if !sample.healthy {
                return (samples, Err(sample));
            }
            let elapsed = started.elapsed();
            if elapsed >= window {
                return (samples, Ok(sample.details));
            }
            tokio::time::sleep(interval.min(window - elapsed)).await;
        }
    }

    /// Marks a version that stopped in `staged` or `watching` as failed,
    /// pointing the host back at what was active before.
    async fn settle_unfinished(
        &self,
        version: &ConfigVersionRecord,
        prior_active: Option<&str>,
        cause: &OrchestratorError,
    ) {
        let current = match self.store.get_config_version_by_id(&version.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not reload config v{} after failure: {}", version.version, e);
                return;
            }
        };
        let restore_active = match current.status {
            ConfigStatus::Staged => None,
            ConfigStatus::Watching => Some(prior_active),
            _ => return,
        };
        warn!(
            "Config v{} on host {} stopped in {}: {}",
            version.version, version.host_id, current.status, cause
        );
        if let Err(e) = self
            .store
            .record_config_failure(
                &version.host_id,
                &version.id,
                &cause.to_string(),
                false,
                restore_active,
            )
            .await
        {
            error!("Failed to mark config v{} failed: {}", version.version, e);
        }
    }

    async fn finish_audit(&self, task_id: &str, result: &OrchResult<ApplyOutcome>) {
        let (status, error, details) = match result {
            Ok(outcome) => {
                let succeeded = matches!(
                    outcome.status,
                    ConfigStatus::Applied | ConfigStatus::Staged
                );
                let status = if succeeded {
                    AuditStatus::Success
                } else {
                    AuditStatus::Failed
                };
                let error = (!succeeded).then(|| outcome.message.clone());
                let details = serde_json::to_value(outcome).unwrap_or(Value::Null);
                (status, error, details)
            }
            Err(e) => (
                AuditStatus::Failed,
                Some(e.to_string()),
                json!({ "error_kind": e.kind() }),
            ),
        };
        if let Err(e) = self
            .store
            .complete_audit(task_id, status, error.as_deref(), &details)
            .await
        {
            warn!("Failed to complete audit task {}: {}", task_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::OrchestratorConfig;
    use crate::core::hosts::test_resolver;
    use crate::core::nginx::health::nginx_probe;
    use crate::core::nginx::mask::SecretMasker;
    use crate::core::nginx::service::{DraftRequest, NginxService};
    use crate::core::nginx::validator::test_configs::{BROKEN, GOOD};
    use crate::core::remote::CommandOutput;
    use crate::core::remote::fake::FakeExecutor;

    const LIVE: &str = "/etc/nginx/managed.d/app.conf";

    struct Harness {
        store: Store,
        fake: Arc<FakeExecutor>,
        service: NginxService,
        engine: ApplyEngine,
        host_id: String,
    }

    async fn harness() -> Harness {
        let store = Store::in_memory().unwrap();
        let (targets, host) = test_resolver(&store).await;
        let fake = Arc::new(FakeExecutor::new());
        let mut config = OrchestratorConfig::default();
        config.nginx.health_interval_secs = 1;
        let timeout = Duration::from_secs(5);
        let validator = Arc::new(Validator::new(fake.clone(), timeout).unwrap());
        let probe = nginx_probe(&config.nginx.health, fake.clone(), timeout).unwrap();
        let service = NginxService::new(
            store.clone(),
            targets.clone(),
            validator.clone(),
            SecretMasker::new().unwrap(),
        );
        let engine = ApplyEngine::new(
            store.clone(),
            fake.clone(),
            targets,
            validator,
            probe,
            HostLocks::new(),
            config.nginx.clone(),
            timeout,
        );
        Harness {
            store,
            fake,
            service,
            engine,
            host_id: host.id,
        }
    }

    impl Harness {
        async fn draft(&self, content: &str) -> ConfigVersionRecord {
            self.service
                .create_draft(
                    &self.host_id,
                    DraftRequest {
                        content: content.to_string(),
                        config_name: Some("app".to_string()),
                        summary: None,
                        author: "ops".to_string(),
                    },
                )
                .await
                .unwrap()
        }

        fn request(&self, config_id: &str, dry_run: bool, window_secs: u64) -> ApplyRequest {
            ApplyRequest {
                config_id: config_id.to_string(),
                dry_run,
                watch_window: Some(Duration::from_secs(window_secs)),
                actor: "ops".to_string(),
            }
        }

        async fn version(&self, id: &str) -> ConfigVersionRecord {
            self.store.get_config_version_by_id(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_preview_apply_and_auto_rollback() {
        let h = harness().await;

        // Invalid draft: preview fails, nothing live changes.
        h.draft(BROKEN).await;
        h.fake.on(
            "nginx -t -c",
            CommandOutput::failed(1, "nginx: [emerg] unexpected end of file"),
        );
        let preview = h.service.preview(&h.host_id, BROKEN).await.unwrap();
        assert!(!preview.is_valid);
        assert!(!preview.errors.is_empty());
        assert!(h.fake.file(LIVE).is_none());

        // Fixed draft applies cleanly through a healthy 5s window.
        h.fake.on("nginx -t -c", CommandOutput::ok("syntax is ok"));
        let good = h.draft(GOOD).await;
        assert!(h.service.preview(&h.host_id, GOOD).await.unwrap().is_valid);
        let outcome = h
            .engine
            .apply(h.request(&good.id, false, 5))
            .await
            .unwrap();
        assert_eq!(outcome.status, ConfigStatus::Applied);
        assert!(outcome.health_samples >= 2);
        let good = h.version(&good.id).await;
        assert_eq!(good.status, ConfigStatus::Applied);
        assert!(good.is_active);
        assert_eq!(h.fake.file(LIVE).as_deref(), Some(GOOD));

        // Next version goes unhealthy mid-window and is rolled back.
        let next_content = GOOD.replace("proxy_read_timeout 60s", "proxy_read_timeout 90s");
        let next = h.draft(&next_content).await;
        h.fake.on_sequence(
            "systemctl is-active",
            vec![
                CommandOutput::ok(""),
                CommandOutput::ok(""),
                CommandOutput::failed(3, "failed"),
            ],
        );
        let outcome = h
            .engine
            .apply(h.request(&next.id, false, 5))
            .await
            .unwrap();
        assert_eq!(outcome.status, ConfigStatus::RolledBack);
        assert!(outcome.rolled_back);
        assert_eq!(outcome.health_samples, 3);

        let next = h.version(&next.id).await;
        assert_eq!(next.status, ConfigStatus::RolledBack);
        assert!(next.rollback_triggered);
        assert!(!next.is_active);
        let good = h.version(&good.id).await;
        assert!(good.is_active);
        assert_eq!(h.fake.file(LIVE).as_deref(), Some(GOOD));

        let audit = h.store.recent_audit(10).await.unwrap();
        assert!(audit.iter().any(|a| a.action == "nginx_config_auto_rollback"));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_never_touches_the_live_file() {
        let h = harness().await;
        h.fake.put_file(LIVE, "old");
        let v = h.draft(GOOD).await;
        let outcome = h.engine.apply(h.request(&v.id, true, 5)).await.unwrap();
        assert_eq!(outcome.status, ConfigStatus::Staged);
        assert!(outcome.dry_run);
        assert_eq!(h.fake.file(LIVE).as_deref(), Some("old"));
        assert_eq!(h.fake.count("systemctl reload"), 0);
        assert_eq!(h.version(&v.id).await.status, ConfigStatus::Draft);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_candidate_fails_fast() {
        let h = harness().await;
        h.fake.on(
            "nginx -t -c",
            CommandOutput::failed(1, "nginx: [emerg] unknown directive \"lisen\""),
        );
        let v = h.draft("server {\n    lisen 80;\n}\n").await;
        let outcome = h.engine.apply(h.request(&v.id, false, 5)).await.unwrap();
        assert_eq!(outcome.status, ConfigStatus::Failed);
        assert_eq!(h.version(&v.id).await.status, ConfigStatus::Failed);
        assert!(h.fake.file(LIVE).is_none());
        assert_eq!(h.fake.count("systemctl reload"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_restores_previous_file() {
        let h = harness().await;
        h.fake.put_file(LIVE, "old");
        h.fake.on("systemctl reload", CommandOutput::failed(1, "reload failed"));
        let v = h.draft(GOOD).await;
        let err = h.engine.apply(h.request(&v.id, false, 5)).await.unwrap_err();
        assert_eq!(err.kind(), "reload_failed");
        assert_eq!(h.fake.file(LIVE).as_deref(), Some("old"));
        let v = h.version(&v.id).await;
        assert_eq!(v.status, ConfigStatus::Failed);
        assert!(!v.is_active);
        assert_eq!(h.fake.files_under("/srv/backups/nginx/").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_parks_the_host() {
        let h = harness().await;
        let v = h.draft(GOOD).await;
        h.fake.on("systemctl is-active", CommandOutput::failed(3, "failed"));
        h.fake.on_sequence(
            "systemctl reload",
            vec![CommandOutput::ok(""), CommandOutput::failed(1, "boom")],
        );
        let err = h.engine.apply(h.request(&v.id, false, 5)).await.unwrap_err();
        assert_eq!(err.kind(), "rollback_failed");

        let host = h.store.get_host(&h.host_id).await.unwrap().unwrap();
        assert_eq!(host.state, HostState::RequiresManualIntervention);
        let v = h.version(&v.id).await;
        assert_eq!(v.status, ConfigStatus::Failed);
        assert!(v.rollback_triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_apply_on_same_host_is_busy() {
        let h = harness().await;
        let v = h.draft(GOOD).await;
        let held = h.engine.prepare(h.request(&v.id, false, 5)).await.unwrap();
        let err = h
            .engine
            .prepare(h.request(&v.id, false, 5))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "host_busy");
        drop(held);
        assert!(h.engine.prepare(h.request(&v.id, false, 5)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn revert_reapplies_previous_version() {
        let h = harness().await;
        let v1 = h.draft(GOOD).await;
        h.engine.apply(h.request(&v1.id, false, 0)).await.unwrap();
        let v2_content = GOOD.replace("20m", "30m");
        let v2 = h.draft(&v2_content).await;
        h.engine.apply(h.request(&v2.id, false, 0)).await.unwrap();
        assert_eq!(h.fake.file(LIVE).as_deref(), Some(v2_content.as_str()));

        let outcome = h.engine.revert(&h.host_id, None, "ops").await.unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(h.fake.file(LIVE).as_deref(), Some(GOOD));
        assert!(h.version(&v1.id).await.is_active);
        let v2 = h.version(&v2.id).await;
        assert_eq!(v2.status, ConfigStatus::RolledBack);
        assert!(v2.rollback_triggered);

        let err = h.engine.revert(&h.host_id, Some(1), "ops").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_after_staging_marks_the_version_failed() {
        let h = harness().await;
        h.fake.put_file(LIVE, "old");
        h.fake.fail(
            "mkdir -p",
            RemoteError::Unreachable {
                host: "203.0.113.10".to_string(),
                message: "No route to host".to_string(),
            },
        );
        let v = h.draft(GOOD).await;
        let err = h.engine.apply(h.request(&v.id, false, 5)).await.unwrap_err();
        assert_eq!(err.kind(), "remote_unreachable");

        let v = h.version(&v.id).await;
        assert_eq!(v.status, ConfigStatus::Failed);
        assert!(!v.is_active);
        assert_eq!(h.fake.file(LIVE).as_deref(), Some("old"));
        assert_eq!(h.fake.count("systemctl reload"), 0);

        let audit = h.store.recent_audit(10).await.unwrap();
        assert!(audit.iter().any(|a| a.action == "nginx_config_apply"));
    }

    #[tokio::test(start_paused = true)]
    async fn version_stopped_while_watching_is_failed_and_prior_reactivated() {
        let h = harness().await;
        let v1 = h.draft(GOOD).await;
        h.engine.apply(h.request(&v1.id, false, 0)).await.unwrap();
        let v2 = h.draft(&GOOD.replace("20m", "30m")).await;
        h.store.begin_config_watch(&h.host_id, &v2.id).await.unwrap();
        assert!(h.version(&v2.id).await.is_active);

        let cause = OrchestratorError::Storage(anyhow::anyhow!("database is locked"));
        h.engine
            .settle_unfinished(&v2, Some(v1.id.as_str()), &cause)
            .await;

        let v2 = h.version(&v2.id).await;
        assert_eq!(v2.status, ConfigStatus::Failed);
        assert!(!v2.is_active);
        assert!(h.version(&v1.id).await.is_active);

        // Terminal versions are left alone.
        h.engine.settle_unfinished(&v2, None, &cause).await;
        assert!(h.version(&v1.id).await.is_active);
    }
}
