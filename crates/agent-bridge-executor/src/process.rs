//! Supervised backend processes.

use std::{path::Path, process::Stdio};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStderr, ChildStdin, ChildStdout, Command},
};
use tokio_util::sync::CancellationToken;

use agent_bridge_core::DriverError;

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                tracing::warn!("Failed to reap backend process: {e}");
                Self {
                    code: None,
                    signal: None,
                }
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|sig| match sig {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Handle used to kill a supervised process. Killing is idempotent.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    kill: CancellationToken,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Request termination of the whole process group.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// OS process id, if known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A freshly spawned backend with its stdio.
pub struct SpawnedProcess {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
    pub handle: ProcessHandle,
}

/// Spawn `program` in its own process group and supervise it.
///
/// `on_exit` runs exactly once when the process ends, whether it exited on
/// its own or through [`ProcessHandle::kill`].
///
/// # Errors
/// Returns error if the process cannot be spawned.
pub fn spawn_supervised<F>(
    program: &Path,
    args: &[String],
    cwd: &Path,
    on_exit: F,
) -> Result<SpawnedProcess, DriverError>
where
    F: FnOnce(ExitInfo) + Send + 'static,
{
    spawn_supervised_with_env(program, args, cwd, &[], on_exit)
}

/// [`spawn_supervised`] with extra environment variables.
///
/// # Errors
/// Returns error if the process cannot be spawned.
pub fn spawn_supervised_with_env<F>(
    program: &Path,
    args: &[String],
    cwd: &Path,
    env: &[(String, String)],
    on_exit: F,
) -> Result<SpawnedProcess, DriverError>
where
    F: FnOnce(ExitInfo) + Send + 'static,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .group_spawn()
        .map_err(|e| DriverError::SpawnFailed(format!("{}: {e}", program.display())))?;

    let inner = child.inner();
    let pid = inner.id();
    let stdin = inner
        .stdin
        .take()
        .ok_or_else(|| DriverError::SpawnFailed("stdin not captured".into()))?;
    let stdout = inner
        .stdout
        .take()
        .ok_or_else(|| DriverError::SpawnFailed("stdout not captured".into()))?;
    let stderr = inner.stderr.take();

    let kill = CancellationToken::new();
    tokio::spawn(supervise(child, kill.clone(), on_exit));

    tracing::debug!(program = %program.display(), ?pid, "Spawned backend process");
    Ok(SpawnedProcess {
        stdin,
        stdout,
        stderr,
        handle: ProcessHandle { kill, pid },
    })
}

async fn supervise<F>(mut child: AsyncGroupChild, kill: CancellationToken, on_exit: F)
where
    F: FnOnce(ExitInfo) + Send + 'static,
{
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = kill.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.kill().await {
                tracing::debug!("Kill on exited process group: {e}");
            }
            child.wait().await
        }
    };

    on_exit(ExitInfo::from_status(status));
}

/// Forward a backend output stream to the debug log, line by line.
pub fn drain_to_log<R>(output: R, agent_id: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                tracing::debug!(%agent_id, "backend output: {line}");
            }
        }
    });
}
