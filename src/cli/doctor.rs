use anyhow::Result;
use std::path::Path;

use crate::core::config::{CONFIG_FILE_NAME, OrchestratorConfig};
use crate::core::terminal::{print_error, print_info, print_step, print_success, print_warn};
use crate::interfaces::web::auth::is_loopback;
use crate::platform::{NativePlatform, Platform};

/// First line of `<binary> <flag>` output, or `None` when it is not on PATH.
/// `ssh -V` reports on stderr.
fn tool_version(binary: &str, flag: &str) -> Option<String> {
    let out = std::process::Command::new(binary).arg(flag).output().ok()?;
    let text = if out.stdout.is_empty() {
        String::from_utf8_lossy(&out.stderr).to_string()
    } else {
        String::from_utf8_lossy(&out.stdout).to_string()
    };
    Some(text.lines().next().unwrap_or("").trim().to_string())
}

fn check_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".doctor-probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

/// Reports on everything the daemon needs locally. Returns whether the
/// critical checks passed; never fails on a missing tool.
pub async fn run_doctor(config_path: Option<&Path>) -> Result<bool> {
    print_step("vpsorch doctor - checking local prerequisites...");
    println!();
    let mut ok = true;

    match tool_version(NativePlatform::ssh_binary(), "-V") {
        Some(version) => print_success(&format!("OpenSSH client is available: {}", version)),
        None => {
            print_error("ssh is missing from PATH. Every remote operation needs it.");
            ok = false;
        }
    }

    match tool_version("sshpass", "-V") {
        Some(version) => print_success(&format!("sshpass is available: {}", version)),
        None => print_warn(
            "sshpass is missing. Hosts onboarded with a password cannot be reached; key-based hosts are unaffected.",
        ),
    }

    let data_dir = NativePlatform::data_dir();
    match check_writable(&data_dir) {
        Ok(()) => {
            NativePlatform::restrict_dir_permissions(&data_dir);
            print_success(&format!("Data directory is writable: {}", data_dir.display()));
        }
        Err(e) => {
            print_error(&format!(
                "Data directory {} is not writable: {}",
                data_dir.display(),
                e
            ));
            ok = false;
        }
    }

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));
    match OrchestratorConfig::load_file(&config_path).await {
        Ok(config) => {
            if config_path.exists() {
                print_success(&format!("Config is valid: {}", config_path.display()));
            } else {
                print_info(&format!(
                    "No config at {}, defaults apply.",
                    config_path.display()
                ));
            }
            if config.api.token.is_none() && !is_loopback(&config.api.host) {
                print_warn(&format!(
                    "api.host is {} but no api.token is set; every request will be rejected.",
                    config.api.host
                ));
            }
        }
        Err(e) => {
            print_error(&format!("Config {} is invalid: {:#}", config_path.display(), e));
            ok = false;
        }
    }

    println!();
    if ok {
        print_success("All critical checks passed.");
    } else {
        print_error("Some critical checks failed. See the messages above.");
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_check_creates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        check_writable(&nested).unwrap();
        assert!(nested.is_dir());
        assert!(!nested.join(".doctor-probe").exists());
    }

    #[test]
    fn missing_tool_has_no_version() {
        assert_eq!(tool_version("vpsorch-no-such-binary", "--version"), None);
    }
}
