mod fs;
mod ssh;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub use fs::RemoteFs;
pub use ssh::SshExecutor;

use crate::core::errors::RemoteError;

/// The one credential a host was onboarded with. A target never carries both,
/// so a session only ever offers a single authentication method.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    PrivateKey(String),
}

impl Credential {
    pub fn auth_type(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey(_) => "private_key",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential::{}(..)", self.auth_type())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl RemoteTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[cfg(test)]
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[cfg(test)]
    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for tools that report on either stream
    /// (`nginx -v`, `nginx -t`).
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Interactive shell attached to a remote host. Dropping it tears the
/// session down.
pub struct ShellSession {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Option<tokio::process::Child>,
}

impl ShellSession {
    pub async fn close(mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs one shell command. A non-zero exit is a normal `CommandOutput`;
    /// only transport failures surface as `RemoteError`.
    async fn run(
        &self,
        target: &RemoteTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    async fn transfer(
        &self,
        target: &RemoteTarget,
        payload: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), RemoteError>;

    /// Opens a pty-backed shell, optionally running `command` instead of the
    /// login shell.
    async fn open_shell(
        &self,
        target: &RemoteTarget,
        command: Option<&str>,
    ) -> Result<ShellSession, RemoteError>;
}

/// POSIX single-quote escaping for values interpolated into remote commands.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
