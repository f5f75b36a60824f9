//! Pseudo-terminal plumbing for interactive subprocesses

use crate::step::StepError;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const READ_CHUNK: usize = 4096;

/// How long to wait for a killed process to be reaped
const REAP_GRACE: Duration = Duration::from_secs(5);

/// What to launch inside the terminal
#[derive(Debug, Clone)]
pub(crate) struct SpawnSpec {
    pub shell: String,
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub size: PtySize,
}

/// A subprocess attached to a pseudo-terminal.
///
/// The halves are handed out separately: the dialogue owns `output` and
/// `writer`, the caller keeps `control` to wait on or kill the process.
pub(crate) struct PtySession {
    pub pid: Option<u32>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    pub writer: Box<dyn Write + Send>,
    pub control: PtyControl,
}

/// Lifecycle handle for the terminal's child process
pub(crate) struct PtyControl {
    killer: Box<dyn ChildKiller + Send + Sync>,
    exit: oneshot::Receiver<std::io::Result<portable_pty::ExitStatus>>,
    // Held so the terminal stays open until the process is reaped
    _master: Box<dyn MasterPty + Send>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Start `spec.shell -c spec.command` on a fresh pseudo-terminal.
///
/// Output is pumped by a dedicated reader thread into an unbounded channel;
/// the channel closes when the terminal reports end-of-stream.
pub(crate) fn spawn(spec: &SpawnSpec) -> Result<PtySession, StepError> {
    let spawn_err = |message: String| StepError::Spawn {
        command: spec.command.clone(),
        message,
    };

    let pair = native_pty_system()
        .openpty(spec.size)
        .map_err(|e| spawn_err(format!("failed to open pty: {}", e)))?;

    let mut cmd = CommandBuilder::new(&spec.shell);
    cmd.arg("-c");
    cmd.arg(&spec.command);
    cmd.cwd(&spec.cwd);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| spawn_err(e.to_string()))?;
    // Only the child may hold the slave side, otherwise EOF never arrives
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| spawn_err(format!("failed to clone pty reader: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| spawn_err(format!("failed to take pty writer: {}", e)))?;

    let (tx, output) = mpsc::unbounded_channel();
    std::thread::spawn(move || pump_output(reader, tx));

    let (exit_tx, exit) = oneshot::channel();
    std::thread::spawn(move || {
        let status = child.wait();
        let _ = exit_tx.send(status);
    });

    tracing::debug!(pid = ?pid, shell = %spec.shell, "spawned interactive process");

    Ok(PtySession {
        pid,
        output,
        writer,
        control: PtyControl {
            killer,
            exit,
            _master: pair.master,
        },
    })
}

fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is closed
            Err(_) => break,
        }
    }
}

impl PtyControl {
    /// Terminate the child; errors mean it is already gone
    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            tracing::debug!(error = %e, "kill on interactive process failed");
        }
    }

    /// Wait for the child to exit and return its exit code
    pub async fn wait(&mut self) -> Option<i32> {
        match (&mut self.exit).await {
            Ok(Ok(status)) => Some(status.exit_code() as i32),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for interactive process");
                None
            }
            Err(_) => None,
        }
    }

    /// Kill the child and reap it, bounded by a short grace period
    pub async fn kill_and_reap(&mut self) -> Option<i32> {
        self.kill();
        match tokio::time::timeout(REAP_GRACE, self.wait()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::warn!("interactive process did not exit after kill");
                None
            }
        }
    }
}
