//! Interactive expect/send automaton
//!
//! Runs a command on a pseudo-terminal and walks an ordered list of
//! prompt/response pairs. Each prompt is a regular expression searched in the
//! output produced since the previous match; on a match the response plus a
//! newline is written to the terminal. After the last response the input side
//! is closed and the process is allowed to run to completion.
//!
//! Two tasks cooperate:
//!
//! - the dialogue task owns the output channel and the terminal writer, and
//!   reports through a single-use completion signal
//! - the caller waits for that signal, drains the rest of the output and
//!   reaps the process, killing it on timeout or cancellation

mod buffer;
mod session;

use crate::signals::CancellationToken;
use crate::step::{StepError, TimeoutScope};
use buffer::OutputBuffer;
use portable_pty::PtySize;
use regex::Regex;
use session::{PtyControl, SpawnSpec};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as Deadline;

/// Pattern reported when the ceiling fires after the dialogue finished
const END_OF_OUTPUT: &str = "<end of output>";

/// Roughly thirty years; stands in for deadlines too large to represent
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// One prompt to wait for and the text to answer it with
#[derive(Debug, Clone)]
pub struct PromptResponse {
    pub pattern: Regex,
    pub response: String,
}

impl PromptResponse {
    pub fn new(pattern: Regex, response: impl Into<String>) -> Self {
        Self {
            pattern,
            response: response.into(),
        }
    }
}

/// A fully rendered interactive run
#[derive(Debug, Clone)]
pub struct DialogueScript {
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub responses: Vec<PromptResponse>,
    /// Bound on the entire run, dialogue and drain included
    pub ceiling: Duration,
    /// Bound on each individual prompt wait
    pub prompt_timeout: Option<Duration>,
}

/// What a completed interactive run produced
#[derive(Debug, Clone)]
pub struct AutomatonOutcome {
    /// Everything the process wrote, with `\r\n` normalized to `\n`
    pub transcript: String,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Number of prompts matched and answered
    pub answered: usize,
    pub duration: Duration,
}

impl AutomatonOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Drives interactive commands through a pseudo-terminal
#[derive(Debug, Clone)]
pub struct InteractiveAutomaton {
    shell: String,
    size: PtySize,
}

impl InteractiveAutomaton {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            size: PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }

    /// Run `script` to completion.
    ///
    /// On every path the child is reaped before this returns. A successful
    /// return means every prompt was answered and the output reached
    /// end-of-stream; the exit code is reported, not judged.
    pub async fn run(
        &self,
        script: DialogueScript,
        cancel: &CancellationToken,
    ) -> Result<AutomatonOutcome, StepError> {
        let started = Instant::now();
        let ceiling = deadline_after(script.ceiling);

        let pty = session::spawn(&SpawnSpec {
            shell: self.shell.clone(),
            command: script.command.clone(),
            cwd: script.cwd.clone(),
            env: script.env.clone(),
            size: self.size,
        })?;
        let pid = pty.pid;
        let mut control = pty.control;

        let local_cancel = CancellationToken::new();
        let dialogue = Dialogue {
            output: pty.output,
            writer: Some(pty.writer),
            buffer: OutputBuffer::new(),
            responses: script.responses,
            prompt_timeout: script.prompt_timeout,
            ceiling,
            started,
            cancel: local_cancel.clone(),
            answered: 0,
        };

        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(dialogue.run(done_tx));

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            signal = done_rx => signal.unwrap_or(Err(StepError::Cancelled)),
        };

        // Stop the dialogue if it is still waiting; it hands back what it read
        local_cancel.cancel();
        let mut dialogue = match task.await {
            Ok(dialogue) => dialogue,
            Err(e) => {
                tracing::error!(error = %e, "dialogue task failed");
                control.kill_and_reap().await;
                return Err(StepError::Cancelled);
            }
        };

        if let Err(err) = verdict {
            let exit_code = control.kill_and_reap().await;
            return Err(with_exit_code(err, exit_code));
        }

        match drain(&mut dialogue, ceiling, cancel).await {
            Ok(()) => {}
            Err(err) => {
                control.kill_and_reap().await;
                return Err(err);
            }
        }

        let exit_code =
            wait_bounded(control, started, dialogue.buffer.text(), ceiling, cancel).await?;
        let answered = dialogue.answered;
        let transcript = dialogue.buffer.into_text();

        tracing::debug!(
            pid = ?pid,
            exit_code = ?exit_code,
            answered,
            "interactive process finished"
        );

        Ok(AutomatonOutcome {
            transcript,
            exit_code,
            pid,
            answered,
            duration: started.elapsed(),
        })
    }
}

/// Read remaining output until end-of-stream, bounded by the ceiling
async fn drain(
    dialogue: &mut Dialogue,
    ceiling: Deadline,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            chunk = dialogue.output.recv() => match chunk {
                Some(bytes) => dialogue.buffer.push(&bytes),
                None => {
                    dialogue.buffer.finish();
                    return Ok(());
                }
            },
            _ = tokio::time::sleep_until(ceiling) => {
                return Err(StepError::ExpectTimeout {
                    pattern: END_OF_OUTPUT.to_string(),
                    scope: TimeoutScope::Ceiling,
                    elapsed: dialogue.started.elapsed(),
                    output: dialogue.buffer.text().to_string(),
                });
            }
        }
    }
}

/// Wait for the process to exit; output is already at end-of-stream so this is short
async fn wait_bounded(
    mut control: PtyControl,
    started: Instant,
    output: &str,
    ceiling: Deadline,
    cancel: &CancellationToken,
) -> Result<Option<i32>, StepError> {
    enum Stop {
        Exited(Option<i32>),
        Cancelled,
        Ceiling,
    }

    let stop = tokio::select! {
        biased;
        _ = cancel.cancelled() => Stop::Cancelled,
        _ = tokio::time::sleep_until(ceiling) => Stop::Ceiling,
        code = control.wait() => Stop::Exited(code),
    };

    match stop {
        Stop::Exited(code) => Ok(code),
        Stop::Cancelled => {
            control.kill_and_reap().await;
            Err(StepError::Cancelled)
        }
        Stop::Ceiling => {
            control.kill_and_reap().await;
            Err(StepError::ExpectTimeout {
                pattern: END_OF_OUTPUT.to_string(),
                scope: TimeoutScope::Ceiling,
                elapsed: started.elapsed(),
                output: output.to_string(),
            })
        }
    }
}

/// `now + limit`, saturating far in the future for huge limits
fn deadline_after(limit: Duration) -> Deadline {
    let now = Deadline::now();
    now.checked_add(limit)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

fn with_exit_code(err: StepError, code: Option<i32>) -> StepError {
    match err {
        StepError::EarlyExit {
            pattern,
            exit_code: None,
            output,
        } => StepError::EarlyExit {
            pattern,
            exit_code: code,
            output,
        },
        other => other,
    }
}

/// The prompt/response walk, run on its own task
struct Dialogue {
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    writer: Option<Box<dyn Write + Send>>,
    buffer: OutputBuffer,
    responses: Vec<PromptResponse>,
    prompt_timeout: Option<Duration>,
    ceiling: Deadline,
    started: Instant,
    cancel: CancellationToken,
    answered: usize,
}

impl Dialogue {
    /// Walk every response, report on `done`, then hand the state back
    async fn run(mut self, done: oneshot::Sender<Result<(), StepError>>) -> Self {
        let result = self.walk().await;
        // Closing the writer signals end-of-input to the process
        self.writer = None;
        let _ = done.send(result);
        self
    }

    async fn walk(&mut self) -> Result<(), StepError> {
        let responses = std::mem::take(&mut self.responses);
        let result = self.walk_responses(&responses).await;
        self.responses = responses;
        result
    }

    async fn walk_responses(&mut self, responses: &[PromptResponse]) -> Result<(), StepError> {
        for (index, item) in responses.iter().enumerate() {
            let (deadline, scope) = self.prompt_deadline();
            let waited_from = Instant::now();
            let mut eof = false;

            let matched = loop {
                if let Some(matched) = self.buffer.find(&item.pattern) {
                    break matched;
                }
                if eof {
                    tracing::warn!(
                        pattern = %item.pattern,
                        answered = self.answered,
                        "process exited before prompt appeared"
                    );
                    return Err(StepError::EarlyExit {
                        pattern: item.pattern.as_str().to_string(),
                        exit_code: None,
                        output: self.buffer.text().to_string(),
                    });
                }

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                    chunk = self.output.recv() => match chunk {
                        Some(bytes) => self.buffer.push(&bytes),
                        None => {
                            self.buffer.finish();
                            eof = true;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::warn!(
                            pattern = %item.pattern,
                            scope = ?scope,
                            "timed out waiting for prompt"
                        );
                        return Err(StepError::ExpectTimeout {
                            pattern: item.pattern.as_str().to_string(),
                            scope,
                            elapsed: match scope {
                                TimeoutScope::Prompt => waited_from.elapsed(),
                                TimeoutScope::Ceiling => self.started.elapsed(),
                            },
                            output: self.buffer.text().to_string(),
                        });
                    }
                }
            };

            tracing::debug!(prompt = index, matched = %matched, "prompt matched");
            self.send(item)?;
            tracing::debug!(prompt = index, response = %item.response, "response sent");
            self.answered += 1;
        }
        Ok(())
    }

    /// The earlier of the per-prompt bound and the ceiling, and which one it is
    fn prompt_deadline(&self) -> (Deadline, TimeoutScope) {
        match self.prompt_timeout {
            Some(limit) => {
                let prompt = deadline_after(limit);
                if prompt < self.ceiling {
                    (prompt, TimeoutScope::Prompt)
                } else {
                    (self.ceiling, TimeoutScope::Ceiling)
                }
            }
            None => (self.ceiling, TimeoutScope::Ceiling),
        }
    }

    fn send(&mut self, item: &PromptResponse) -> Result<(), StepError> {
        let send_err = |source| StepError::Send {
            pattern: item.pattern.as_str().to_string(),
            source,
        };
        let writer = self.writer.as_mut().ok_or_else(|| {
            send_err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "terminal input already closed",
            ))
        })?;
        writer
            .write_all(format!("{}\n", item.response).as_bytes())
            .and_then(|()| writer.flush())
            .map_err(send_err)
    }
}
