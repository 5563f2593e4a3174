use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

use super::diff::line_diff;
use super::mask::SecretMasker;
use super::validator::{ValidationResult, Validator};
use crate::core::errors::{OrchResult, OrchestratorError};
use crate::core::hosts::TargetResolver;
use crate::core::store::Store;
use crate::core::store::types::{AuditRecord, ConfigVersionRecord, NewConfigVersion};

pub const DEFAULT_CONFIG_NAME: &str = "default";

#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub content: String,
    pub config_name: Option<String>,
    pub summary: Option<String>,
    pub author: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NginxStatus {
    pub host_id: String,
    pub active_version: Option<ConfigVersionRecord>,
    pub version_count: i64,
    pub recent_failures: Vec<AuditRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub content: &'static str,
}

const TEMPLATES: &[ConfigTemplate] = &[
    ConfigTemplate {
        name: "reverse_proxy",
        description: "Plain HTTP reverse proxy to a local upstream",
        content: r#"server {
    listen 80;
    server_name example.com;
    client_max_body_size 20m;

    add_header X-Content-Type-Options nosniff;
    add_header X-Frame-Options SAMEORIGIN;
    add_header X-XSS-Protection "1; mode=block";

    location / {
        proxy_pass http://127.0.0.1:8069;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout 120s;
    }
}
"#,
    },
    ConfigTemplate {
        name: "tls_reverse_proxy",
        description: "HTTPS reverse proxy with an HTTP to HTTPS redirect",
        content: r#"server {
    listen 80;
    server_name example.com;
    return 301 https://$host$request_uri;
}

server {
    listen 443 ssl;
    server_name example.com;
    ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/example.com/privkey.pem;
    client_max_body_size 20m;

    add_header X-Content-Type-Options nosniff;
    add_header X-Frame-Options SAMEORIGIN;
    add_header X-XSS-Protection "1; mode=block";
    add_header Strict-Transport-Security "max-age=31536000" always;

    location / {
        proxy_pass http://127.0.0.1:8069;
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-Proto https;
        proxy_read_timeout 120s;
    }
}
"#,
    },
];

/// Config names become file stems on the host.
pub fn validate_config_name(name: &str) -> OrchResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "config name '{}' must match [A-Za-z0-9_.-]+",
            name
        )))
    }
}

pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Versioned config documents per host: drafting, reads with masking,
/// previews and status.
pub struct NginxService {
    store: Store,
    targets: TargetResolver,
    validator: Arc<Validator>,
    masker: SecretMasker,
}

impl NginxService {
    pub fn new(
        store: Store,
        targets: TargetResolver,
        validator: Arc<Validator>,
        masker: SecretMasker,
    ) -> Self {
        Self {
            store,
            targets,
            validator,
            masker,
        }
    }

    async fn require_host(&self, host_id: &str) -> OrchResult<()> {
        self.store
            .get_host(host_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(format!("host {}", host_id)))
    }

    /// Every edit is a new version; nothing already stored is rewritten.
    pub async fn create_draft(
        &self,
        host_id: &str,
        req: DraftRequest,
    ) -> OrchResult<ConfigVersionRecord> {
        self.require_host(host_id).await?;
        if req.content.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "config content is empty".to_string(),
            ));
        }
        let config_name = req
            .config_name
            .unwrap_or_else(|| DEFAULT_CONFIG_NAME.to_string());
        validate_config_name(&config_name)?;

        let new = NewConfigVersion {
            host_id: host_id.to_string(),
            config_name,
            checksum: checksum(&req.content),
            author: req.author,
            summary: req.summary.unwrap_or_default(),
            content: req.content,
        };
        let record = self.store.insert_config_version(&new, line_diff).await?;
        info!(
            "Created nginx config draft v{} ({}) for host {}",
            record.version, record.config_name, host_id
        );
        Ok(self.masked(record))
    }

    pub async fn list(&self, host_id: &str) -> OrchResult<Vec<ConfigVersionRecord>> {
        self.require_host(host_id).await?;
        let versions = self.store.list_config_versions(host_id).await?;
        Ok(versions.into_iter().map(|v| self.masked(v)).collect())
    }

    /// `unmasked` is for internal callers that ship the content to a host.
    pub async fn get(
        &self,
        host_id: &str,
        version: i64,
        unmasked: bool,
    ) -> OrchResult<ConfigVersionRecord> {
        let record = self
            .store
            .get_config_version(host_id, version)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("version {} of host {}", version, host_id))
            })?;
        Ok(if unmasked { record } else { self.masked(record) })
    }

    pub async fn preview(&self, host_id: &str, content: &str) -> OrchResult<ValidationResult> {
        let (_, target) = self.targets.resolve(host_id).await?;
        let result = self.validator.preview(&target, content).await?;
        info!(
            "Preview for host {}: valid={} errors={} warnings={}",
            host_id,
            result.is_valid,
            result.errors.len(),
            result.warnings.len()
        );
        Ok(result)
    }

    pub async fn status(&self, host_id: &str) -> OrchResult<NginxStatus> {
        self.require_host(host_id).await?;
        let active_version = self
            .store
            .active_config_version(host_id)
            .await?
            .map(|v| self.masked(v));
        let version_count = self.store.count_config_versions(host_id).await?;
        let since = Utc::now() - ChronoDuration::days(1);
        let recent_failures = self
            .store
            .recent_failures("nginx", since, 20)
            .await?
            .into_iter()
            .filter(|a| a.resource_id == host_id)
            .collect();
        Ok(NginxStatus {
            host_id: host_id.to_string(),
            active_version,
            version_count,
            recent_failures,
        })
    }

    pub fn templates(&self) -> &'static [ConfigTemplate] {
        TEMPLATES
    }

    fn masked(&self, mut record: ConfigVersionRecord) -> ConfigVersionRecord {
        record.content = self.masker.mask(&record.content);
        record.diff_text = self.masker.mask(&record.diff_text);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hosts::test_resolver;
    use crate::core::nginx::validator::ConfigLinter;
    use crate::core::remote::fake::FakeExecutor;
    use std::time::Duration;

    async fn service() -> (NginxService, String, Arc<FakeExecutor>) {
        let store = Store::in_memory().unwrap();
        let (targets, host) = test_resolver(&store).await;
        let fake = Arc::new(FakeExecutor::new());
        let validator = Arc::new(Validator::new(fake.clone(), Duration::from_secs(5)).unwrap());
        let service = NginxService::new(store, targets, validator, SecretMasker::new().unwrap());
        (service, host.id, fake)
    }

    fn draft(content: &str) -> DraftRequest {
        DraftRequest {
            content: content.to_string(),
            config_name: Some("app".to_string()),
            summary: Some("initial".to_string()),
            author: "ops".to_string(),
        }
    }

    #[tokio::test]
    async fn drafts_number_from_one_with_checksum_and_diff() {
        let (service, host_id, _) = service().await;
        let v1 = service
            .create_draft(&host_id, draft("server {\n    listen 80;\n}\n"))
            .await
            .unwrap();
        let v2 = service
            .create_draft(&host_id, draft("server {\n    listen 8080;\n}\n"))
            .await
            .unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(v1.checksum.len(), 64);
        assert_eq!((v2.diff_added, v2.diff_removed), (1, 1));

        let listed = service.list(&host_id).await.unwrap();
        assert_eq!(
            listed.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![2, 1]
        );
    }

    #[tokio::test]
    async fn reads_are_masked_but_stored_content_is_intact() {
        let (service, host_id, _) = service().await;
        let content = "server {\n    auth_basic_user_file /etc/nginx/.htpasswd;\n}\n";
        service.create_draft(&host_id, draft(content)).await.unwrap();

        let shown = service.get(&host_id, 1, false).await.unwrap();
        assert!(shown.content.contains("[MASKED]"));
        let raw = service.get(&host_id, 1, true).await.unwrap();
        assert_eq!(raw.content, content);
        assert_eq!(raw.checksum, checksum(content));
    }

    #[tokio::test]
    async fn bad_names_and_unknown_hosts_are_rejected() {
        let (service, host_id, _) = service().await;
        let mut req = draft("server {}");
        req.config_name = Some("../etc/passwd".to_string());
        let err = service.create_draft(&host_id, req).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let err = service
            .create_draft("nope", draft("server {}"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn preview_never_touches_live_paths() {
        let (service, host_id, fake) = service().await;
        fake.put_file("/etc/nginx/managed.d/app.conf", "live");
        let result = service
            .preview(&host_id, crate::core::nginx::validator::test_configs::GOOD)
            .await
            .unwrap();
        assert!(result.is_valid);
        assert_eq!(fake.file("/etc/nginx/managed.d/app.conf").as_deref(), Some("live"));
        assert_eq!(fake.count("systemctl reload"), 0);
    }

    #[test]
    fn templates_pass_the_linter() {
        let linter = ConfigLinter::new().unwrap();
        for template in TEMPLATES {
            let (errors, _) = linter.lint(template.content);
            assert!(errors.is_empty(), "{}: {:?}", template.name, errors);
        }
    }
}
