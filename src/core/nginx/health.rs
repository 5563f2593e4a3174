use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::{ADDRESS_PLACEHOLDER, HealthProbeConfig};
use crate::core::remote::{RemoteExecutor, RemoteTarget, shell_quote};

/// One observation taken during a watch window.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub healthy: bool,
    pub reason: Option<String>,
    pub details: Value,
}

impl HealthSample {
    pub fn healthy(details: Value) -> Self {
        Self {
            healthy: true,
            reason: None,
            details,
        }
    }

    pub fn unhealthy(reason: impl Into<String>, details: Value) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
            details,
        }
    }
}

/// A way of deciding whether a service is still healthy. Transport errors
/// count as negative samples, never as errors.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sample(&self, target: &RemoteTarget) -> HealthSample;
}

/// Service unit is active and something listens on the control port.
pub struct ProcessProbe {
    exec: Arc<dyn RemoteExecutor>,
    unit: String,
    control_port: u16,
    timeout: Duration,
}

impl ProcessProbe {
    pub fn new(exec: Arc<dyn RemoteExecutor>, unit: &str, control_port: u16, timeout: Duration) -> Self {
        Self {
            exec,
            unit: unit.to_string(),
            control_port,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for ProcessProbe {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn sample(&self, target: &RemoteTarget) -> HealthSample {
        let active = self
            .exec
            .run(
                target,
                &format!("systemctl is-active --quiet {}", shell_quote(&self.unit)),
                self.timeout,
            )
            .await;
        match active {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return HealthSample::unhealthy(
                    format!("{} is not active", self.unit),
                    json!({ "unit": self.unit, "output": out.combined() }),
                );
            }
            Err(e) => {
                return HealthSample::unhealthy(
                    format!("could not query {}: {}", self.unit, e),
                    json!({ "unit": self.unit, "error_kind": e.kind() }),
                );
            }
        }

        let listening = self
            .exec
            .run(
                target,
                &format!(
                    "ss -ltnH | awk '{{print $4}}' | grep -qE '[:.]{}$'",
                    self.control_port
                ),
                self.timeout,
            )
            .await;
        match listening {
            Ok(out) if out.success() => HealthSample::healthy(
                json!({ "unit": self.unit, "active": true, "port": self.control_port }),
            ),
            Ok(_) => HealthSample::unhealthy(
                format!("nothing listening on port {}", self.control_port),
                json!({ "unit": self.unit, "active": true, "port": self.control_port }),
            ),
            Err(e) => HealthSample::unhealthy(
                format!("could not inspect listeners: {}", e),
                json!({ "unit": self.unit, "error_kind": e.kind() }),
            ),
        }
    }
}

/// Error lines the unit logged in the last minute stay at or below a limit.
pub struct JournalProbe {
    exec: Arc<dyn RemoteExecutor>,
    unit: String,
    max_errors: u32,
    timeout: Duration,
}

impl JournalProbe {
    pub fn new(exec: Arc<dyn RemoteExecutor>, unit: &str, max_errors: u32, timeout: Duration) -> Self {
        Self {
            exec,
            unit: unit.to_string(),
            max_errors,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for JournalProbe {
    fn name(&self) -> &'static str {
        "journal"
    }

    async fn sample(&self, target: &RemoteTarget) -> HealthSample {
        let command = format!(
            "journalctl -u {} --since '1 minute ago' --no-pager -q | grep -ci error || true",
            shell_quote(&self.unit)
        );
        match self.exec.run(target, &command, self.timeout).await {
            Ok(out) => {
                let count: u32 = out.stdout.trim().parse().unwrap_or(0);
                let details = json!({ "unit": self.unit, "recent_errors": count });
                if count > self.max_errors {
                    HealthSample::unhealthy(
                        format!("{} error lines in the last minute", count),
                        details,
                    )
                } else {
                    HealthSample::healthy(details)
                }
            }
            Err(e) => HealthSample::unhealthy(
                format!("could not read journal: {}", e),
                json!({ "unit": self.unit, "error_kind": e.kind() }),
            ),
        }
    }
}

/// HTTP GET from the orchestrator side; 2xx and 3xx count as healthy. The
/// URL is a template whose `{address}` is replaced by the sampled host.
pub struct HttpProbe {
    client: reqwest::Client,
    url_template: String,
}

impl HttpProbe {
    pub fn new(url_template: &str, timeout: Duration) -> Result<Self> {
        if !url_template.contains(ADDRESS_PLACEHOLDER) {
            anyhow::bail!(
                "health URL '{}' must contain {}",
                url_template,
                ADDRESS_PLACEHOLDER
            );
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            url_template: url_template.to_string(),
        })
    }

    fn url_for(&self, target: &RemoteTarget) -> String {
        let host = if target.address.contains(':') {
            format!("[{}]", target.address)
        } else {
            target.address.clone()
        };
        self.url_template.replace(ADDRESS_PLACEHOLDER, &host)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn sample(&self, target: &RemoteTarget) -> HealthSample {
        let url = self.url_for(target);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status();
                let details = json!({ "url": url, "status": status.as_u16() });
                if status.is_success() || status.is_redirection() {
                    HealthSample::healthy(details)
                } else {
                    HealthSample::unhealthy(format!("{} returned {}", url, status), details)
                }
            }
            Err(e) => HealthSample::unhealthy(
                format!("{} unreachable: {}", url, e),
                json!({ "url": url }),
            ),
        }
    }
}

/// Healthy only when every inner probe is. Stops at the first negative.
pub struct AllOf {
    probes: Vec<Box<dyn HealthProbe>>,
}

impl AllOf {
    pub fn new(probes: Vec<Box<dyn HealthProbe>>) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl HealthProbe for AllOf {
    fn name(&self) -> &'static str {
        "all_of"
    }

    async fn sample(&self, target: &RemoteTarget) -> HealthSample {
        let mut details = serde_json::Map::new();
        for probe in &self.probes {
            let sample = probe.sample(target).await;
            details.insert(probe.name().to_string(), sample.details);
            if !sample.healthy {
                return HealthSample {
                    healthy: false,
                    reason: sample.reason,
                    details: Value::Object(details),
                };
            }
        }
        HealthSample::healthy(Value::Object(details))
    }
}

/// Builds the probe used during nginx watch windows from `[nginx.health]`.
pub fn nginx_probe(
    config: &HealthProbeConfig,
    exec: Arc<dyn RemoteExecutor>,
    timeout: Duration,
) -> Result<Arc<dyn HealthProbe>> {
    let process = Box::new(ProcessProbe::new(
        exec.clone(),
        "nginx",
        config.control_port,
        timeout,
    ));
    let journal = Box::new(JournalProbe::new(
        exec,
        "nginx",
        config.max_journal_errors,
        timeout,
    ));
    let probe: Arc<dyn HealthProbe> = match config.kind.as_str() {
        "http" => {
            let url = config
                .http_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("nginx.health.http_url is required for kind = \"http\""))?;
            Arc::new(AllOf::new(vec![process, Box::new(HttpProbe::new(url, timeout)?)]))
        }
        _ => Arc::new(AllOf::new(vec![process, journal])),
    };
    Ok(probe)
}
