//! Managed hosts: onboarding, bootstrap, health checks and credential
//! resolution for every other subsystem.

mod bootstrap;
mod service;
mod target;

pub use bootstrap::{BootstrapReport, BootstrapStep};
pub use service::{HostHealth, HostService, OnboardOutcome, OnboardRequest};
pub use target::TargetResolver;

#[cfg(test)]
pub(crate) use target::test_resolver;
