//! Non-interactive shell command step

use super::{ExecutionContext, StepContract, StepError, StepMeta, StepResult};
use crate::cleanup::CleanupAction;
use crate::process::{ProcessError, ShellCommand, run_shell};
use crate::signals::with_cancellation;
use async_trait::async_trait;

/// Runs `inline` through the shell with piped output
#[derive(Debug, Clone, Default)]
pub struct CommandStep {
    pub inline: String,
    pub chdir: Option<String>,
    pub cleanup: Option<String>,
}

impl CommandStep {
    pub fn new(inline: impl Into<String>) -> Self {
        Self {
            inline: inline.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl StepContract for CommandStep {
    fn validate(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        if self.inline.trim().is_empty() {
            return Err(StepError::validation("inline must be provided"));
        }
        ctx.templates().validate(&self.inline)?;
        if let Some(cleanup) = &self.cleanup {
            ctx.templates().validate(cleanup)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        meta: &StepMeta,
    ) -> Result<StepResult, StepError> {
        let script = ctx.render(&self.inline, meta)?;
        let command = ShellCommand {
            shell: ctx.settings.shell.clone(),
            script,
            cwd: ctx.resolve_dir(self.chdir.as_deref()),
            env: ctx.env.clone(),
            timeout: ctx.settings.command_timeout,
        };

        tracing::info!(step = %meta.name, "running command");

        let Some(output) = with_cancellation(&ctx.cancel, run_shell(&command)).await else {
            return Err(StepError::Cancelled);
        };

        let result = match output {
            Ok(output) => StepResult::from(output),
            Err(ProcessError::Spawn { shell, source }) => {
                return Err(StepError::Spawn {
                    command: shell,
                    message: source.to_string(),
                });
            }
            Err(ProcessError::Timeout { elapsed }) => {
                return Err(StepError::CommandFailed {
                    exit_code: None,
                    output: format!("command timed out after {:?}", elapsed),
                });
            }
            Err(e) => {
                return Err(StepError::CommandFailed {
                    exit_code: None,
                    output: e.to_string(),
                });
            }
        };

        if !result.success {
            return Err(StepError::CommandFailed {
                exit_code: result.exit_code,
                output: result.combined_output(),
            });
        }
        Ok(result)
    }

    fn cleanup_action(
        &self,
        ctx: &ExecutionContext,
        meta: &StepMeta,
    ) -> Result<Option<CleanupAction>, StepError> {
        let Some(cleanup) = self.cleanup.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };
        Ok(Some(CleanupAction {
            step: meta.name.clone(),
            command: ctx.render(cleanup, meta)?,
            cwd: Some(ctx.resolve_dir(self.chdir.as_deref())),
        }))
    }
}
