//! Executable lookup for backend CLIs.

use std::{
    collections::HashSet,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

/// Resolve an executable by name.
///
/// Search order:
/// 1. Explicit paths (absolute or containing a separator).
/// 2. The current process PATH.
/// 3. The PATH a login shell would see (for servers launched outside a shell).
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    let executable = executable.trim();
    if executable.is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_async(executable, None).await {
        return Some(found);
    }

    let login_path = login_shell_path().await?;
    let current = std::env::var_os("PATH").unwrap_or_default();
    let merged = merge_paths(&current, &login_path);
    if merged == current {
        return None;
    }
    tracing::debug!(executable, "Retrying lookup with login shell PATH");
    which_async(executable, Some(merged)).await
}

/// Merge two PATH strings, dropping duplicates and empty entries.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let merged: Vec<PathBuf> = std::env::split_paths(primary.as_ref())
        .chain(std::env::split_paths(secondary.as_ref()))
        .filter(|p| !p.as_os_str().is_empty() && seen.insert(p.clone()))
        .collect();

    std::env::join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: &str, path: Option<OsString>) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || match path {
        Some(path) => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            which::which_in(executable, Some(path), cwd)
        }
        None => which::which(executable),
    })
    .await
    .ok()
    .and_then(Result::ok)
}

#[cfg(unix)]
async fn login_shell_path() -> Option<OsString> {
    use std::{process::Stdio, time::Duration};

    use tokio::process::Command;

    const LOGIN_SHELL_TIMEOUT: Duration = Duration::from_secs(5);

    let shell = std::env::var_os("SHELL")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| OsString::from("/bin/sh"));

    let child = Command::new(&shell)
        .args(["-l", "-c", "printf '%s' \"$PATH\""])
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .ok()?;

    let output = match tokio::time::timeout(LOGIN_SHELL_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            tracing::debug!(?shell, "Failed to read PATH from login shell: {e}");
            return None;
        }
        Err(_) => {
            tracing::warn!(?shell, "Timed out reading PATH from login shell");
            return None;
        }
    };

    let path = String::from_utf8(output.stdout).ok()?;
    let path = path.trim();
    (!path.is_empty()).then(|| OsString::from(path))
}

#[cfg(not(unix))]
async fn login_shell_path() -> Option<OsString> {
    None
}
