//! Subprocess plumbing shared by probing, ad removal, remuxing and the
//! streaming compositor.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Output};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("command failed ({command}): {stderr}")]
    Failure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}

/// Runs `command` to completion and fails on timeout or a non-zero exit.
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    command: &mut Command,
    limit: Duration,
) -> Result<Output, CommandError> {
    let program = describe(command);
    let output = match timeout(limit, executor.run(command)).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(CommandError::Spawn { program, source }),
        Err(_) => {
            return Err(CommandError::Timeout {
                program,
                timeout: limit,
            })
        }
    };
    if !output.status.success() {
        return Err(CommandError::Failure {
            command: program,
            status: output.status.code(),
            stderr: tail_lossy(&output.stderr, 4096),
        });
    }
    Ok(output)
}

/// Asks the child to exit with SIGTERM and kills it when it is still running
/// after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    if let Some(pid) = child.id() {
        let signalled = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .kill_on_drop(true)
            .status()
            .await;
        match signalled {
            Ok(status) if status.success() => debug!(pid, "sent SIGTERM"),
            Ok(status) => debug!(pid, ?status, "kill -TERM returned non-zero"),
            Err(err) => debug!(pid, error = %err, "kill -TERM unavailable"),
        }
        if let Ok(waited) = timeout(grace, child.wait()).await {
            return waited;
        }
        warn!(pid, ?grace, "process ignored SIGTERM; killing");
    }
    child.kill().await?;
    child.wait().await
}

pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg: &OsStr| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Last `limit` bytes of `bytes` as text.
pub fn tail_lossy(bytes: &[u8], limit: usize) -> String {
    let start = bytes.len().saturating_sub(limit);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_joins_program_and_args() {
        let mut command = Command::new("ffmpeg");
        command.arg("-y").arg("-i").arg("in.ts");
        assert_eq!(describe(&command), "ffmpeg -y -i in.ts");
    }

    #[test]
    fn tail_keeps_last_bytes() {
        assert_eq!(tail_lossy(b"abcdef", 3), "def");
        assert_eq!(tail_lossy(b"ab", 10), "ab");
    }

    #[tokio::test]
    async fn run_checked_surfaces_failure_status() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo boom >&2; exit 3");
        let err = run_checked(&SystemCommandExecutor, &mut command, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            CommandError::Failure { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let status = terminate(&mut child, Duration::from_secs(2)).await.unwrap();
        assert!(!status.success());
    }
}
