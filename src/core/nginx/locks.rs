use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::errors::{OrchResult, OrchestratorError};

/// Advisory per-host locks for apply/rollback sequences. A second claim on a
/// held host is refused, never queued.
#[derive(Clone, Default)]
pub struct HostLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, host_id: &str) -> OrchResult<HostLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(host_id.to_string()) {
            return Err(OrchestratorError::HostBusy(host_id.to_string()));
        }
        Ok(HostLockGuard {
            held: self.held.clone(),
            host_id: host_id.to_string(),
        })
    }

    #[cfg(test)]
    pub fn is_held(&self, host_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(host_id)
    }
}

/// Releases the host when dropped, including when a background apply task
/// panics or is aborted.
pub struct HostLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    host_id: String,
}

impl HostLockGuard {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_busy_until_release() {
        let locks = HostLocks::new();
        let guard = locks.try_acquire("h1").unwrap();
        let err = locks.try_acquire("h1").err().unwrap();
        assert_eq!(err.kind(), "host_busy");
        assert!(locks.try_acquire("h2").is_ok());

        drop(guard);
        assert!(!locks.is_held("h1"));
        assert!(locks.try_acquire("h1").is_ok());
    }
}
