use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandOutput, Credential, RemoteExecutor, RemoteTarget, ShellSession, shell_quote};
use crate::core::errors::RemoteError;
use crate::platform::{NativePlatform, Platform};

/// Remote executor that shells out to the system `ssh` client. Password
/// credentials go through `sshpass -e` so the secret never shows up in argv.
pub struct SshExecutor {
    connect_timeout: Duration,
    key_dir: PathBuf,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration, key_dir: PathBuf) -> Self {
        Self {
            connect_timeout,
            key_dir,
        }
    }

    /// Private keys are materialized per host with 0600 permissions because
    /// `ssh -i` only accepts a path.
    async fn key_file(&self, target: &RemoteTarget, key: &str) -> Result<PathBuf, RemoteError> {
        if !self.key_dir.exists() {
            tokio::fs::create_dir_all(&self.key_dir)
                .await
                .map_err(|e| RemoteError::Io(format!("create key dir: {}", e)))?;
            NativePlatform::restrict_dir_permissions(&self.key_dir);
        }
        let path = self.key_dir.join(format!("{}.key", target.host_id));
        let mut material = key.trim_end().to_string();
        material.push('\n');
        let current = tokio::fs::read_to_string(&path).await.ok();
        if current.as_deref() != Some(material.as_str()) {
            tokio::fs::write(&path, material)
                .await
                .map_err(|e| RemoteError::Io(format!("write key file: {}", e)))?;
            NativePlatform::restrict_file_permissions(&path);
        }
        Ok(path)
    }

    async fn base_command(&self, target: &RemoteTarget, tty: bool) -> Result<Command, RemoteError> {
        let mut cmd = match &target.credential {
            Credential::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password)
                    .arg("-e")
                    .arg(NativePlatform::ssh_binary());
                cmd.arg("-o")
                    .arg("PubkeyAuthentication=no")
                    .arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive");
                cmd
            }
            Credential::PrivateKey(key) => {
                let key_path = self.key_file(target, key).await?;
                let mut cmd = Command::new(NativePlatform::ssh_binary());
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg("IdentitiesOnly=yes")
                    .arg("-o")
                    .arg("PasswordAuthentication=no")
                    .arg("-i")
                    .arg(key_path);
                cmd
            }
        };
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-p")
            .arg(target.port.to_string());
        if tty {
            cmd.arg("-tt");
        }
        cmd.arg(target.destination());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

/// Maps a finished ssh process onto the transport taxonomy. ssh reserves
/// exit 255 for its own failures; sshpass exits 5 on a rejected password.
fn classify(
    target: &RemoteTarget,
    exit_code: i32,
    stdout: String,
    stderr: String,
) -> Result<CommandOutput, RemoteError> {
    let uses_password = matches!(target.credential, Credential::Password(_));
    let auth_rejected = || RemoteError::AuthenticationFailed {
        host: target.address.clone(),
        user: target.username.clone(),
    };

    if uses_password && exit_code == 5 && stdout.is_empty() && stderr.trim().is_empty() {
        return Err(auth_rejected());
    }

    if exit_code == 255 {
        let lowered = stderr.to_lowercase();
        if lowered.contains("permission denied")
            || lowered.contains("authentication failed")
            || lowered.contains("too many authentication failures")
        {
            return Err(auth_rejected());
        }
        let message = if stderr.trim().is_empty() {
            "ssh connection failed".to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(RemoteError::Unreachable {
            host: target.address.clone(),
            message,
        });
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn spawn_error(e: std::io::Error, uses_password: bool) -> RemoteError {
    if e.kind() == std::io::ErrorKind::NotFound {
        let tool = if uses_password { "sshpass" } else { "ssh" };
        RemoteError::Io(format!("{} is not installed or not on PATH", tool))
    } else {
        RemoteError::Io(format!("failed to launch ssh: {}", e))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &RemoteTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        debug!("ssh {} ({}s): {}", target.destination(), timeout.as_secs(), command);
        let uses_password = matches!(target.credential, Credential::Password(_));
        let mut cmd = self.base_command(target, false).await?;
        cmd.arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| spawn_error(e, uses_password))?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => {
                warn!(
                    "ssh command on {} timed out after {}s",
                    target.address,
                    timeout.as_secs()
                );
                Err(RemoteError::Timeout {
                    host: target.address.clone(),
                    seconds: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => Err(RemoteError::Io(format!("ssh wait failed: {}", e))),
            Ok(Ok(output)) => classify(
                target,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ),
        }
    }

    async fn transfer(
        &self,
        target: &RemoteTarget,
        payload: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        debug!(
            "ssh {} upload {} bytes -> {}",
            target.destination(),
            payload.len(),
            remote_path
        );
        let uses_password = matches!(target.credential, Credential::Password(_));
        let mut cmd = self.base_command(target, false).await?;
        cmd.arg(format!("cat > {}", shell_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(e, uses_password))?;
        let upload = async move {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, upload).await {
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: target.address.clone(),
                    seconds: timeout.as_secs(),
                });
            }
            Ok(Err(e)) => return Err(RemoteError::Io(format!("upload failed: {}", e))),
            Ok(Ok(output)) => output,
        };

        let result = classify(
            target,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        )?;
        if result.success() {
            Ok(())
        } else {
            Err(RemoteError::FileOperation {
                path: remote_path.to_string(),
                message: result.combined(),
            })
        }
    }

    async fn open_shell(
        &self,
        target: &RemoteTarget,
        command: Option<&str>,
    ) -> Result<ShellSession, RemoteError> {
        let uses_password = matches!(target.credential, Credential::Password(_));
        let mut cmd = self.base_command(target, true).await?;
        if let Some(command) = command {
            cmd.arg(command);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| spawn_error(e, uses_password))?;
        let input = child
            .stdin
            .take()
            .ok_or_else(|| RemoteError::Io("shell stdin unavailable".to_string()))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::Io("shell stdout unavailable".to_string()))?;

        Ok(ShellSession {
            input: Box::new(input),
            output: Box::new(output),
            child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(credential: Credential) -> RemoteTarget {
        RemoteTarget {
            host_id: "h1".to_string(),
            address: "203.0.113.10".to_string(),
            port: 22,
            username: "deploy".to_string(),
            credential,
        }
    }

    #[test]
    fn exit_255_with_permission_denied_is_auth_failure() {
        let t = target(Credential::PrivateKey("k".to_string()));
        let err = classify(
            &t,
            255,
            String::new(),
            "deploy@203.0.113.10: Permission denied (publickey).".to_string(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "authentication_failed");
    }

    #[test]
    fn exit_255_otherwise_is_unreachable() {
        let t = target(Credential::PrivateKey("k".to_string()));
        let err = classify(
            &t,
            255,
            String::new(),
            "ssh: connect to host 203.0.113.10 port 22: Connection refused".to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable { .. }));
    }

    #[test]
    fn sshpass_rejection_is_auth_failure_only_for_password_targets() {
        let pw = target(Credential::Password("p".to_string()));
        assert!(matches!(
            classify(&pw, 5, String::new(), String::new()),
            Err(RemoteError::AuthenticationFailed { .. })
        ));

        let key = target(Credential::PrivateKey("k".to_string()));
        let out = classify(&key, 5, String::new(), String::new()).unwrap();
        assert_eq!(out.exit_code, 5);
    }

    #[test]
    fn ordinary_non_zero_exit_is_a_result_not_an_error() {
        let t = target(Credential::PrivateKey("k".to_string()));
        let out = classify(&t, 1, String::new(), "nginx: [emerg] bad".to_string()).unwrap();
        assert!(!out.success());
        assert_eq!(out.stderr, "nginx: [emerg] bad");
    }

    #[tokio::test]
    async fn key_file_is_written_once_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SshExecutor::new(Duration::from_secs(5), dir.path().join("keys"));
        let t = target(Credential::PrivateKey("-----BEGIN KEY-----\nabc".to_string()));
        let path = exec.key_file(&t, "-----BEGIN KEY-----\nabc").await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "-----BEGIN KEY-----\nabc\n");
        let again = exec.key_file(&t, "-----BEGIN KEY-----\nabc").await.unwrap();
        assert_eq!(path, again);
    }
}
