use std::time::Duration;

use super::{CommandOutput, RemoteExecutor, RemoteTarget, shell_quote};
use crate::core::errors::RemoteError;

/// File primitives on a remote host, each a single shell command bounded by
/// the same timeout.
pub struct RemoteFs<'a> {
    exec: &'a dyn RemoteExecutor,
    target: &'a RemoteTarget,
    timeout: Duration,
}

impl<'a> RemoteFs<'a> {
    pub fn new(exec: &'a dyn RemoteExecutor, target: &'a RemoteTarget, timeout: Duration) -> Self {
        Self {
            exec,
            target,
            timeout,
        }
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.exec.run(self.target, command, self.timeout).await
    }

    async fn run_checked(&self, command: &str, path: &str) -> Result<(), RemoteError> {
        let out = self.run(command).await?;
        if out.success() {
            Ok(())
        } else {
            Err(RemoteError::FileOperation {
                path: path.to_string(),
                message: out.combined(),
            })
        }
    }

    /// `None` when the file does not exist or cannot be read.
    #[cfg(test)]
    pub async fn read(&self, path: &str) -> Result<Option<String>, RemoteError> {
        let out = self.run(&format!("cat -- {}", shell_quote(path))).await?;
        Ok(out.success().then_some(out.stdout))
    }

    pub async fn write(&self, path: &str, content: &str) -> Result<(), RemoteError> {
        self.exec
            .transfer(self.target, content.as_bytes(), path, self.timeout)
            .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        let out = self.run(&format!("test -e {}", shell_quote(path))).await?;
        Ok(out.success())
    }

    pub async fn mkdir_p(&self, path: &str) -> Result<(), RemoteError> {
        self.run_checked(&format!("mkdir -p -- {}", shell_quote(path)), path)
            .await
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.run_checked(
            &format!("cp -p -- {} {}", shell_quote(from), shell_quote(to)),
            to,
        )
        .await
    }

    /// Same-filesystem rename, atomic for readers of `to`.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.run_checked(
            &format!("mv -f -- {} {}", shell_quote(from), shell_quote(to)),
            to,
        )
        .await
    }

    pub async fn remove(&self, path: &str) -> Result<(), RemoteError> {
        self.run_checked(&format!("rm -f -- {}", shell_quote(path)), path)
            .await
    }

    pub async fn symlink(&self, target: &str, link: &str) -> Result<(), RemoteError> {
        self.run_checked(
            &format!("ln -sfn -- {} {}", shell_quote(target), shell_quote(link)),
            link,
        )
        .await
    }
}
