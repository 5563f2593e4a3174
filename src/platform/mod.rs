use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Binary used to open SSH sessions (`"ssh"` / `"ssh.exe"`).
    fn ssh_binary() -> &'static str;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for vpsorch.
    /// Unix: `~/.vpsorch`, Windows: `%APPDATA%\vpsorch`.
    fn data_dir() -> PathBuf;
}

/// `VPSORCH_HOME` overrides the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("VPSORCH_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
