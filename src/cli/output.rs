//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use crate::runner::RunResult;
use crate::step::StepState;
use serde::Serialize;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Events emitted while running a procedure
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutputEvent {
    RunStart {
        name: String,
        steps: usize,
    },
    StepComplete {
        name: String,
        kind: &'static str,
        state: StepState,
        duration_ms: u64,
        error: Option<String>,
    },
    CleanupFailed {
        step: String,
        error: String,
    },
    RunComplete {
        success: bool,
        duration_ms: u64,
        steps_executed: usize,
        cleanups_run: usize,
    },
    RunError {
        error: String,
    },
    Info {
        message: String,
    },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    fn emit(&self, event: OutputEvent);

    /// Write final result
    fn result(&self, success: bool, output: Option<&str>);
}

/// Replay a finished run as events
pub fn emit_run(handler: &dyn OutputHandler, result: &RunResult) {
    for record in &result.steps {
        if record.state == StepState::Unvalidated {
            continue;
        }
        handler.emit(OutputEvent::StepComplete {
            name: record.name.clone(),
            kind: record.kind,
            state: record.state,
            duration_ms: record.duration_ms,
            error: record.error.clone(),
        });
    }

    if let (Some(step), Some(error)) = (&result.failed_step, &result.error) {
        handler.emit(OutputEvent::RunError {
            error: format!("step '{}' failed ({}): {}", step, error.kind(), error),
        });
    }

    for failure in &result.cleanup_failures {
        handler.emit(OutputEvent::CleanupFailed {
            step: failure.step.clone(),
            error: failure.message.clone(),
        });
    }

    handler.emit(OutputEvent::RunComplete {
        success: result.success(),
        duration_ms: result.duration.as_millis() as u64,
        steps_executed: result.outputs.len(),
        cleanups_run: result.cleanups_run.len(),
    });
}

/// Console output handler
pub struct ConsoleHandler;

impl ConsoleHandler {
    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::RunStart { name, steps } => {
                eprintln!("Running procedure '{}' ({} steps)", name, steps);
            }
            OutputEvent::StepComplete {
                name,
                kind,
                state,
                duration_ms,
                error,
            } => {
                let mark = match state {
                    StepState::Failed | StepState::CleanupFailed => "✗",
                    StepState::Skipped => "-",
                    _ => "✓",
                };
                eprintln!(
                    "{} {} [{}] {} ({})",
                    mark,
                    name,
                    kind,
                    state,
                    Self::format_duration(duration_ms)
                );
                if let Some(error) = error {
                    eprintln!("    {}", error);
                }
            }
            OutputEvent::CleanupFailed { step, error } => {
                eprintln!("Cleanup of '{}' failed: {}", step, error);
            }
            OutputEvent::RunComplete {
                success,
                duration_ms,
                steps_executed,
                cleanups_run,
            } => {
                eprintln!();
                if success {
                    eprintln!(
                        "✓ Procedure completed ({} steps, {} cleanups in {})",
                        steps_executed,
                        cleanups_run,
                        Self::format_duration(duration_ms)
                    );
                } else {
                    eprintln!(
                        "✗ Procedure failed after {} steps ({} cleanups, {})",
                        steps_executed,
                        cleanups_run,
                        Self::format_duration(duration_ms)
                    );
                }
            }
            OutputEvent::RunError { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
        }
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// JSON output handler, one object per line
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        match json {
            Ok(s) => println!("{}", s),
            Err(e) => tracing::error!(error = %e, "failed to serialize output"),
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn result(&self, success: bool, output: Option<&str>) {
        #[derive(Serialize)]
        struct FinalResult<'a> {
            success: bool,
            output: Option<&'a str>,
        }

        self.print_json(&FinalResult { success, output });
    }
}

/// Quiet handler that only prints the final output
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

pub fn create_handler(mode: OutputMode) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler),
        OutputMode::Json => Box::new(JsonHandler::new(false)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}
