//! Procedure run state

use crate::cleanup::{CleanupLedger, EntryState, TeardownReport};
use crate::config::Ttp;
use crate::step::{CleanupError, StepError, StepResult, StepState};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle record for one step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    /// Variant name ("inline" or "expect")
    pub kind: &'static str,
    pub state: StepState,
    /// Error message if the step failed
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Current state of a procedure run
#[derive(Debug)]
pub struct RunState {
    pub name: String,
    pub records: Vec<StepRecord>,
    pub started_at: Instant,
    /// First blocking error and the step it came from
    pub error: Option<(String, StepError)>,
}

impl RunState {
    pub fn new(ttp: &Ttp) -> Self {
        let records = ttp
            .steps
            .iter()
            .map(|s| StepRecord {
                name: s.meta.name.clone(),
                kind: s.kind.name(),
                state: StepState::Unvalidated,
                error: None,
                duration_ms: 0,
            })
            .collect();
        Self {
            name: ttp.name.clone(),
            records,
            started_at: Instant::now(),
            error: None,
        }
    }

    pub fn set(&mut self, index: usize, state: StepState) {
        if let Some(record) = self.records.get_mut(index) {
            record.state = state;
        }
    }

    pub fn executed(&mut self, index: usize, duration: Duration) {
        if let Some(record) = self.records.get_mut(index) {
            record.state = StepState::Executed;
            record.duration_ms = duration.as_millis() as u64;
        }
    }

    /// Mark a step failed; only the first failure becomes the run's error
    pub fn fail(&mut self, index: usize, error: StepError, duration: Duration) {
        let name = match self.records.get_mut(index) {
            Some(record) => {
                record.state = StepState::Failed;
                record.error = Some(error.to_string());
                record.duration_ms = duration.as_millis() as u64;
                record.name.clone()
            }
            None => String::new(),
        };
        if self.error.is_none() {
            self.error = Some((name, error));
        }
    }

    /// Abort before `index` ran because the run was cancelled
    pub fn cancel_before(&mut self, index: usize) {
        if self.error.is_none() {
            let name = self
                .records
                .get(index)
                .map(|r| r.name.clone())
                .unwrap_or_default();
            self.error = Some((name, StepError::Cancelled));
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Fold ledger entry states back into the step records
    pub fn apply_cleanup(&mut self, ledger: &CleanupLedger) {
        for record in &mut self.records {
            match ledger.state_for(&record.name) {
                Some(EntryState::CleanedUp) => record.state = StepState::CleanedUp,
                Some(EntryState::Failed(_)) => record.state = StepState::CleanupFailed,
                _ => {}
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Result of running a procedure
#[derive(Debug)]
pub struct RunResult {
    pub name: String,
    /// Per-step records in declaration order
    pub steps: Vec<StepRecord>,
    /// Captured output of every executed step
    pub outputs: HashMap<String, StepResult>,
    /// First blocking error
    pub error: Option<StepError>,
    /// Step that raised `error`
    pub failed_step: Option<String>,
    /// Every teardown failure, in the order they occurred
    pub cleanup_failures: Vec<CleanupError>,
    /// Steps whose teardown ran, in execution order
    pub cleanups_run: Vec<String>,
    pub duration: Duration,
}

impl RunResult {
    pub fn from_state(
        state: RunState,
        outputs: HashMap<String, StepResult>,
        report: TeardownReport,
    ) -> Self {
        let duration = state.elapsed();
        let (failed_step, error) = match state.error {
            Some((step, error)) => (Some(step), Some(error)),
            None => (None, None),
        };
        Self {
            name: state.name,
            steps: state.records,
            outputs,
            error,
            failed_step,
            cleanup_failures: report.failures,
            cleanups_run: report.executed,
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.cleanup_failures.is_empty()
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of steps that failed to validate or execute
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Failed)
            .map(|s| s.name.as_str())
            .collect()
    }
}
