//! Procedure steps and the contract every step variant follows
//!
//! A step is validated, executed once, and may register a teardown action.
//! Variants form a closed set: plain shell commands and interactive expect
//! dialogues.

mod command;
mod context;
mod errors;
mod expect;

pub use command::CommandStep;
pub use context::{EngineSettings, ExecutionContext};
pub use errors::{CleanupError, StepError, TimeoutScope};
pub use expect::{ExpectSpec, ExpectStep};

use crate::cleanup::CleanupAction;
use crate::config::ArgSpec;
use crate::process::ShellOutput;
use async_trait::async_trait;
use serde::Serialize;

/// Captured output of an executed step
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(stdout: String, duration_ms: u64) -> Self {
        Self {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
            duration_ms,
        }
    }

    /// A run that exited non-zero; `output` is everything it printed
    pub fn failed(exit_code: Option<i32>, output: String) -> Self {
        Self {
            stdout: output,
            exit_code,
            ..Default::default()
        }
    }

    /// stdout followed by stderr, separated by a newline when both are present
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

impl From<ShellOutput> for StepResult {
    fn from(output: ShellOutput) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            success: output.success,
            duration_ms: output.duration.as_millis() as u64,
        }
    }
}

/// Where a step stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Unvalidated,
    Validated,
    Executed,
    CleanedUp,
    CleanupFailed,
    Skipped,
    Failed,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unvalidated => "unvalidated",
            Self::Validated => "validated",
            Self::Executed => "executed",
            Self::CleanedUp => "cleaned up",
            Self::CleanupFailed => "cleanup failed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Fields shared by every step variant
#[derive(Debug, Clone, Default)]
pub struct StepMeta {
    pub name: String,
    pub description: Option<String>,
    /// Platforms the step runs on; empty means all
    pub supported_platforms: Vec<String>,
    /// Step-scoped arguments with defaults
    pub args: Vec<ArgSpec>,
}

impl StepMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the step applies to `platform` (e.g. "linux")
    pub fn runs_on(&self, platform: &str) -> bool {
        let wanted = canonical_platform(platform);
        self.supported_platforms.is_empty()
            || self
                .supported_platforms
                .iter()
                .any(|p| canonical_platform(p) == wanted)
    }
}

/// Lowercased platform name with `darwin` folded into `macos`
fn canonical_platform(name: &str) -> String {
    match name.trim().to_ascii_lowercase().as_str() {
        "darwin" => "macos".to_string(),
        other => other.to_string(),
    }
}

/// Validate, Execute and Cleanup as implemented by each variant
#[async_trait]
pub trait StepContract: Send + Sync {
    /// Structural checks only; must not start anything
    fn validate(&self, ctx: &ExecutionContext) -> Result<(), StepError>;

    /// Perform the step's action exactly once
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        meta: &StepMeta,
    ) -> Result<StepResult, StepError>;

    /// The teardown this step declares, rendered against the current context
    fn cleanup_action(
        &self,
        ctx: &ExecutionContext,
        meta: &StepMeta,
    ) -> Result<Option<CleanupAction>, StepError>;
}

/// The closed set of step variants
#[derive(Debug, Clone)]
pub enum StepKind {
    Command(CommandStep),
    Expect(ExpectStep),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command(_) => "inline",
            Self::Expect(_) => "expect",
        }
    }
}

/// A named step in a procedure
#[derive(Debug, Clone)]
pub struct Step {
    pub meta: StepMeta,
    pub kind: StepKind,
}

impl Step {
    pub fn new(meta: StepMeta, kind: StepKind) -> Self {
        Self { meta, kind }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    fn contract(&self) -> &dyn StepContract {
        match &self.kind {
            StepKind::Command(step) => step,
            StepKind::Expect(step) => step,
        }
    }

    pub fn validate(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        if self.meta.name.trim().is_empty() {
            return Err(StepError::validation("step name must be provided"));
        }
        self.contract().validate(ctx)
    }

    /// Execute the step, record its output, and register its teardown.
    ///
    /// Output is recorded first so the teardown can reference it. A run that
    /// exited non-zero is recorded too. The teardown is registered whether
    /// the action succeeded or failed, unless the failure happened before
    /// anything ran.
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StepResult, StepError> {
        let contract = self.contract();
        let outcome = contract.execute(ctx, &self.meta).await;

        match &outcome {
            Ok(result) => ctx.record_output(&self.meta.name, result.clone()),
            Err(StepError::CommandFailed {
                exit_code: Some(code),
                output,
            }) => {
                let failed = StepResult::failed(Some(*code), output.clone());
                ctx.record_output(&self.meta.name, failed);
            }
            Err(_) => {}
        }

        let register = match &outcome {
            Ok(_) => true,
            Err(e) => e.permits_cleanup(),
        };
        if register {
            match contract.cleanup_action(ctx, &self.meta) {
                Ok(Some(action)) => {
                    ctx.ledger.register(action);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        step = %self.meta.name,
                        error = %e,
                        "could not render cleanup"
                    );
                    ctx.ledger.reject(CleanupError {
                        step: self.meta.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        outcome
    }
}
