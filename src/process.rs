//! Shell command execution with captured output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

fn exit_status_code_parts(code: Option<i32>, _signal: Option<i32>) -> Option<i32> {
    if let Some(code) = code {
        return Some(code);
    }
    #[cfg(unix)]
    {
        if let Some(signal) = _signal {
            return Some(128 + signal);
        }
    }
    None
}

/// Extract exit code from ExitStatus, using 128+signal for signal-terminated processes on Unix.
pub(crate) fn exit_status_code(status: &std::process::ExitStatus) -> Option<i32> {
    let code = status.code();
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    exit_status_code_parts(code, signal)
}

/// Attempt to capture the exit code from a child process.
/// Tries non-blocking first, falls back to blocking wait if process hasn't exited.
pub(crate) async fn capture_exit_code(child: &mut Child) -> Option<i32> {
    match child.try_wait() {
        Ok(Some(status)) => exit_status_code(&status),
        Ok(None) => child
            .wait()
            .await
            .ok()
            .and_then(|status| exit_status_code(&status)),
        Err(_) => None,
    }
}

/// Stream types for child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Errors from running a shell command
#[derive(Debug, Error)]
pub(crate) enum ProcessError {
    #[error("failed to spawn '{shell}': {source}")]
    Spawn {
        shell: String,
        source: std::io::Error,
    },

    #[error("failed to read {stream}: {source}")]
    Read {
        stream: OutputStream,
        source: std::io::Error,
        exit_code: Option<i32>,
    },

    #[error("failed to wait for process: {source}")]
    Wait { source: std::io::Error },

    #[error("command timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

/// A command line handed to `<shell> -c`
#[derive(Debug, Clone)]
pub(crate) struct ShellCommand {
    pub shell: String,
    pub script: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// Captured result of a finished shell command
#[derive(Debug, Clone)]
pub(crate) struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration: Duration,
}

/// Run a shell command to completion, killing it if `timeout` elapses.
pub(crate) async fn run_shell(command: &ShellCommand) -> Result<ShellOutput, ProcessError> {
    let start = Instant::now();

    let mut child = Command::new(&command.shell)
        .arg("-c")
        .arg(&command.script)
        .current_dir(&command.cwd)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            shell: command.shell.clone(),
            source,
        })?;

    tracing::debug!(pid = ?child.id(), shell = %command.shell, "spawned shell command");

    match tokio::time::timeout(command.timeout, wait_for_child_output(&mut child)).await {
        Ok(Ok((stdout, stderr, status))) => Ok(ShellOutput {
            stdout,
            stderr,
            exit_code: exit_status_code(&status),
            success: status.success(),
            duration: start.elapsed(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let _ = child.kill().await;
            Err(ProcessError::Timeout {
                elapsed: start.elapsed(),
            })
        }
    }
}

/// Wait for child output, reading stdout/stderr concurrently to avoid deadlock.
/// Invalid UTF-8 is replaced rather than treated as an error.
pub(crate) async fn wait_for_child_output(
    child: &mut Child,
) -> Result<(String, String, std::process::ExitStatus), ProcessError> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_fut = async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_pipe {
            out.read_to_end(&mut buf)
                .await
                .map_err(|e| (OutputStream::Stdout, e))?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    };

    let stderr_fut = async move {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_pipe {
            err.read_to_end(&mut buf)
                .await
                .map_err(|e| (OutputStream::Stderr, e))?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    };

    let (stdout, stderr) = match tokio::try_join!(stdout_fut, stderr_fut) {
        Ok(result) => result,
        Err((stream, source)) => {
            let _ = child.kill().await;
            let exit_code = capture_exit_code(child).await;
            return Err(ProcessError::Read {
                stream,
                source,
                exit_code,
            });
        }
    };

    let status = child
        .wait()
        .await
        .map_err(|source| ProcessError::Wait { source })?;

    Ok((stdout, stderr, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, cwd: &std::path::Path) -> ShellCommand {
        ShellCommand {
            shell: "sh".into(),
            script: script.into(),
            cwd: cwd.to_path_buf(),
            env: HashMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn exit_code_passthrough() {
        assert_eq!(exit_status_code_parts(Some(0), None), Some(0));
        assert_eq!(exit_status_code_parts(Some(42), None), Some(42));
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_code() {
        // SIGKILL (9) -> 128 + 9 = 137
        assert_eq!(exit_status_code_parts(None, Some(9)), Some(137));
        assert_eq!(exit_status_code_parts(None, Some(15)), Some(143));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_exit_code() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("exit 42")
            .spawn()
            .expect("failed to spawn");

        assert_eq!(capture_exit_code(&mut child).await, Some(42));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_captures_both_streams() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = run_shell(&sh("printf 'out'; printf 'err' >&2", dir.path()))
            .await
            .unwrap();

        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_env_and_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cmd = sh("printf '%s' \"$TTP_MARKER\"; pwd", dir.path());
        cmd.env.insert("TTP_MARKER".into(), "marker-".into());

        let out = run_shell(&cmd).await.unwrap();

        assert!(out.stdout.starts_with("marker-"));
        let expected = dir.path().canonicalize().unwrap();
        let printed = std::path::PathBuf::from(out.stdout.trim_start_matches("marker-").trim());
        assert_eq!(printed.canonicalize().unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_nonzero_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = run_shell(&sh("printf 'output'; exit 42", dir.path()))
            .await
            .unwrap();

        assert!(!out.success);
        assert_eq!(out.exit_code, Some(42));
        assert_eq!(out.stdout, "output");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_lossy_utf8() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = run_shell(&sh("printf 'a\\377b'", dir.path())).await.unwrap();
        assert_eq!(out.stdout, "a\u{FFFD}b");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cmd = sh("sleep 5", dir.path());
        cmd.timeout = Duration::from_millis(100);

        let result = run_shell(&cmd).await;
        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_shell_spawn_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cmd = sh("true", dir.path());
        cmd.shell = "/nonexistent/shell".into();

        let result = run_shell(&cmd).await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
