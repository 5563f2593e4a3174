use std::sync::Arc;

use crate::core::errors::{OrchResult, OrchestratorError};
use crate::core::remote::{Credential, RemoteTarget};
use crate::core::store::Store;
use crate::core::store::types::HostRecord;
use crate::core::vault::CredentialVault;

/// Turns stored host records into connectable targets, unsealing the one
/// credential each host was onboarded with.
#[derive(Clone)]
pub struct TargetResolver {
    store: Store,
    vault: Arc<CredentialVault>,
}

impl TargetResolver {
    pub fn new(store: Store, vault: Arc<CredentialVault>) -> Self {
        Self { store, vault }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn target_for(&self, host: &HostRecord) -> OrchResult<RemoteTarget> {
        let secret = self.vault.open(&host.sealed_credential)?;
        let credential = match host.auth_type.as_str() {
            "password" => Credential::Password(secret),
            "private_key" => Credential::PrivateKey(secret),
            other => {
                return Err(OrchestratorError::InvalidInput(format!(
                    "host {} has unknown auth type '{}'",
                    host.id, other
                )));
            }
        };
        Ok(RemoteTarget {
            host_id: host.id.clone(),
            address: host.address.clone(),
            port: host.port,
            username: host.username.clone(),
            credential,
        })
    }

    pub async fn resolve(&self, host_id: &str) -> OrchResult<(HostRecord, RemoteTarget)> {
        let host = self
            .store
            .get_host(host_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("host {}", host_id)))?;
        let target = self.target_for(&host)?;
        Ok((host, target))
    }
}

/// A store holding one password host plus a resolver that can unseal it.
#[cfg(test)]
pub(crate) async fn test_resolver(store: &Store) -> (TargetResolver, HostRecord) {
    use crate::core::store::test_support::sample_host;

    let vault = Arc::new(CredentialVault::new(Some("test-secret")).unwrap());
    let mut new = sample_host("203.0.113.10");
    new.sealed_credential = vault.seal("s3cret").unwrap();
    let host = store.insert_host(&new).await.unwrap();
    (TargetResolver::new(store.clone(), vault), host)
}
