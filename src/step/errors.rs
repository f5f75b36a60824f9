//! Failure taxonomy for step execution

use std::time::Duration;
use thiserror::Error;

/// Number of trailing output characters kept in error messages
const OUTPUT_TAIL_CHARS: usize = 400;

/// Which deadline fired while waiting for a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// The ceiling bounding the whole dialogue
    Ceiling,
    /// The bound on a single prompt wait
    Prompt,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ceiling => write!(f, "ceiling"),
            Self::Prompt => write!(f, "per-prompt"),
        }
    }
}

/// Errors raised by Validate, Execute and Cleanup
#[derive(Debug, Error)]
pub enum StepError {
    /// Structural problem found before anything ran
    #[error("{message}")]
    Validation { message: String },

    /// The subprocess could not be started
    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    /// A prompt did not appear in time
    #[error(
        "timed out ({scope} timeout, {elapsed:?}) waiting for prompt {pattern:?}; output so far: {}",
        tail(.output)
    )]
    ExpectTimeout {
        pattern: String,
        scope: TimeoutScope,
        elapsed: Duration,
        output: String,
    },

    /// The subprocess ended before every prompt was answered
    #[error(
        "process exited early (exit code {}) while waiting for prompt {pattern:?}; output so far: {}",
        .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()),
        tail(.output)
    )]
    EarlyExit {
        pattern: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Writing a response to the subprocess failed
    #[error("failed to send response for prompt {pattern:?}: {source}")]
    Send {
        pattern: String,
        source: std::io::Error,
    },

    /// The command ran but did not succeed
    #[error("command failed with exit code {}: {}",
        .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()),
        tail(.output)
    )]
    CommandFailed {
        exit_code: Option<i32>,
        output: String,
    },

    /// A teardown command failed
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// Command text could not be rendered
    #[error("template error: {0}")]
    Template(#[from] crate::template::TemplateError),

    /// The run was aborted while the step was in progress
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Whether the step's cleanup may still run after this error.
    ///
    /// Validation, spawn and template failures happen before the step acted,
    /// so there is nothing to tear down.
    pub fn permits_cleanup(&self) -> bool {
        !matches!(
            self,
            Self::Validation { .. } | Self::Spawn { .. } | Self::Template(_)
        )
    }

    /// Short machine-friendly name of the error category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Spawn { .. } => "spawn",
            Self::ExpectTimeout { .. } => "expect_timeout",
            Self::EarlyExit { .. } => "early_exit",
            Self::Send { .. } => "send",
            Self::CommandFailed { .. } => "command_failed",
            Self::Cleanup(_) => "cleanup",
            Self::Template(_) => "template",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single teardown entry that failed
#[derive(Debug, Clone, Error)]
#[error("cleanup for step '{step}' failed: {message}")]
pub struct CleanupError {
    pub step: String,
    pub message: String,
}

fn tail(output: &str) -> String {
    let count = output.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return format!("{:?}", output);
    }
    let tail: String = output.chars().skip(count - OUTPUT_TAIL_CHARS).collect();
    format!("...{:?}", tail)
}
