//! Nginx configuration safety pipeline: versioned drafts, previews against a
//! staged copy, and apply with health watch and automatic rollback.

pub mod apply;
mod diff;
pub mod health;
mod locks;
mod mask;
pub mod service;
pub mod validator;

pub use apply::{ApplyEngine, ApplyOutcome, ApplyRequest, PreparedApply};
pub use health::{HealthProbe, nginx_probe};
pub use locks::HostLocks;
pub use mask::SecretMasker;
pub use service::{DraftRequest, NginxService};
pub use validator::{ValidationResult, Validator};

#[cfg(test)]
pub(crate) use diff::line_diff;
