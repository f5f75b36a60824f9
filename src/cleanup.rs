//! Cleanup ledger: teardown actions recorded during a run and replayed in reverse

use crate::process::{ShellCommand, run_shell};
use crate::step::{CleanupError, StepError, StepResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// When registered cleanup actions run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// All actions run once, after the forward pass
    #[default]
    Deferred,
    /// A step's actions run as soon as its Execute returns
    Immediate,
}

/// A teardown command registered by a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupAction {
    /// Name of the step that registered the action
    pub step: String,
    /// Rendered command text
    pub command: String,
    /// Working directory override
    pub cwd: Option<PathBuf>,
}

/// Lifecycle of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    CleanedUp,
    Failed(String),
}

#[derive(Debug)]
struct Entry {
    action: CleanupAction,
    state: EntryState,
}

/// Something that can carry out a cleanup action
#[async_trait]
pub trait CleanupExecutor: Send + Sync {
    async fn run(&self, action: &CleanupAction) -> Result<StepResult, StepError>;
}

/// Outcome of draining (part of) the ledger
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Steps whose actions ran, in execution order
    pub executed: Vec<String>,
    /// Every failure, not just the first
    pub failures: Vec<CleanupError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: TeardownReport) {
        self.executed.extend(other.executed);
        self.failures.extend(other.failures);
    }
}

/// Append-only record of teardown actions.
///
/// Entries are never reordered. Draining visits pending entries last-first and
/// marks each one, so an entry runs at most once.
#[derive(Debug, Default)]
pub struct CleanupLedger {
    entries: Vec<Entry>,
    // Teardowns that could not even be rendered; reported by the next drain
    rejected: Vec<CleanupError>,
}

impl CleanupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action, returning its position
    pub fn register(&mut self, action: CleanupAction) -> usize {
        tracing::debug!(step = %action.step, "registered cleanup action");
        self.entries.push(Entry {
            action,
            state: EntryState::Pending,
        });
        self.entries.len() - 1
    }

    /// Record a teardown that could not be prepared
    pub fn reject(&mut self, failure: CleanupError) {
        self.rejected.push(failure);
    }

    /// Position the next registration will take
    pub fn mark(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries not yet drained
    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .count()
    }

    /// State of the most recent entry registered by `step`
    pub fn state_for(&self, step: &str) -> Option<&EntryState> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.action.step == step)
            .map(|e| &e.state)
    }

    /// Drain every pending entry, last-registered first
    pub async fn teardown(&mut self, executor: &dyn CleanupExecutor) -> TeardownReport {
        self.unwind_from(0, executor).await
    }

    /// Drain pending entries at positions `>= mark`, last-registered first
    pub async fn unwind_from(
        &mut self,
        mark: usize,
        executor: &dyn CleanupExecutor,
    ) -> TeardownReport {
        let mut report = TeardownReport {
            executed: Vec::new(),
            failures: std::mem::take(&mut self.rejected),
        };

        for entry in self.entries.iter_mut().skip(mark).rev() {
            if entry.state != EntryState::Pending {
                continue;
            }

            let step = entry.action.step.clone();
            match executor.run(&entry.action).await {
                Ok(_) => {
                    tracing::info!(step = %step, "cleanup succeeded");
                    entry.state = EntryState::CleanedUp;
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(step = %step, error = %message, "cleanup failed");
                    entry.state = EntryState::Failed(message.clone());
                    report.failures.push(CleanupError {
                        step: step.clone(),
                        message,
                    });
                }
            }
            report.executed.push(step);
        }

        report
    }
}

/// Runs cleanup commands through the shell
#[derive(Debug, Clone)]
pub struct ShellCleanupExecutor {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

#[async_trait]
impl CleanupExecutor for ShellCleanupExecutor {
    async fn run(&self, action: &CleanupAction) -> Result<StepResult, StepError> {
        let command = ShellCommand {
            shell: self.shell.clone(),
            script: action.command.clone(),
            cwd: action.cwd.clone().unwrap_or_else(|| self.cwd.clone()),
            env: self.env.clone(),
            timeout: self.timeout,
        };

        let output = run_shell(&command).await.map_err(|e| StepError::Cleanup(CleanupError {
            step: action.step.clone(),
            message: e.to_string(),
        }))?;

        let result = StepResult::from(output);
        if result.success {
            Ok(result)
        } else {
            Err(StepError::CommandFailed {
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }
}

/// Merge several reports into one, preserving order
pub fn merge_reports(reports: impl IntoIterator<Item = TeardownReport>) -> TeardownReport {
    let mut merged = TeardownReport::default();
    for report in reports {
        merged.absorb(report);
    }
    merged
}
