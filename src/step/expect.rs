//! Interactive step: drive a program through its prompts

use super::{ExecutionContext, StepContract, StepError, StepMeta, StepResult};
use crate::automaton::{DialogueScript, InteractiveAutomaton, PromptResponse};
use crate::cleanup::CleanupAction;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One prompt pattern and the line sent when it appears
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Response {
    /// Regular expression matched against new terminal output
    pub prompt: String,
    /// Sent followed by a newline; may be empty
    #[serde(default)]
    pub response: String,
}

#[cfg(test)]
impl Response {
    pub fn new(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
        }
    }
}

/// The `expect:` block of a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExpectSpec {
    #[serde(default)]
    pub inline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<String>,
    #[serde(default)]
    pub responses: Vec<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<String>,
    /// Ceiling for the whole dialogue, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Bound on each prompt wait, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_timeout: Option<u64>,
}

/// Step that runs `expect.inline` on a pseudo-terminal and answers its prompts
#[derive(Debug, Clone, Default)]
pub struct ExpectStep {
    /// `None` when the block was omitted or written as `expect: ~`
    pub expect: Option<ExpectSpec>,
}

impl ExpectStep {
    pub fn new(spec: ExpectSpec) -> Self {
        Self { expect: Some(spec) }
    }

    fn spec(&self) -> Result<&ExpectSpec, StepError> {
        self.expect
            .as_ref()
            .ok_or_else(|| StepError::validation("expect block must be provided"))
    }
}

#[async_trait]
impl StepContract for ExpectStep {
    fn validate(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let spec = self.spec()?;
        if spec.inline.trim().is_empty() {
            return Err(StepError::validation("inline must be provided"));
        }

        for (index, item) in spec.responses.iter().enumerate() {
            if item.prompt.is_empty() {
                return Err(StepError::validation(format!(
                    "response {} has an empty prompt",
                    index + 1
                )));
            }
            Regex::new(&item.prompt).map_err(|e| {
                StepError::validation(format!(
                    "response {} has an invalid prompt pattern {:?}: {}",
                    index + 1,
                    item.prompt,
                    e
                ))
            })?;
            ctx.templates().validate(&item.response)?;
        }

        ctx.templates().validate(&spec.inline)?;
        if let Some(cleanup) = &spec.cleanup {
            ctx.templates().validate(cleanup)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        meta: &StepMeta,
    ) -> Result<StepResult, StepError> {
        let spec = self.spec()?;

        let command = ctx.render(&spec.inline, meta)?;
        let mut responses = Vec::with_capacity(spec.responses.len());
        for item in &spec.responses {
            let pattern = Regex::new(&item.prompt).map_err(|e| {
                StepError::validation(format!("invalid prompt pattern {:?}: {}", item.prompt, e))
            })?;
            // Prompts are patterns, not templates; only the response is rendered
            responses.push(PromptResponse::new(pattern, ctx.render(&item.response, meta)?));
        }

        let script = DialogueScript {
            command,
            cwd: ctx.resolve_dir(spec.chdir.as_deref()),
            env: ctx.env.clone(),
            responses,
            ceiling: spec
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(ctx.settings.expect_timeout),
            prompt_timeout: spec
                .prompt_timeout
                .map(Duration::from_secs)
                .or(ctx.settings.prompt_timeout),
        };

        tracing::info!(
            step = %meta.name,
            prompts = script.responses.len(),
            "starting interactive command"
        );

        let outcome = InteractiveAutomaton::new(ctx.settings.shell.clone())
            .run(script, &ctx.cancel)
            .await?;

        tracing::info!(
            step = %meta.name,
            pid = ?outcome.pid,
            answered = outcome.answered,
            exit_code = ?outcome.exit_code,
            "interactive command finished"
        );

        if !outcome.success() {
            return Err(StepError::CommandFailed {
                exit_code: outcome.exit_code,
                output: outcome.transcript,
            });
        }

        Ok(StepResult {
            stdout: outcome.transcript,
            stderr: String::new(),
            exit_code: outcome.exit_code,
            success: true,
            duration_ms: outcome.duration.as_millis() as u64,
        })
    }

    fn cleanup_action(
        &self,
        ctx: &ExecutionContext,
        meta: &StepMeta,
    ) -> Result<Option<CleanupAction>, StepError> {
        let Some(spec) = &self.expect else {
            return Ok(None);
        };
        let Some(cleanup) = spec.cleanup.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };
        Ok(Some(CleanupAction {
            step: meta.name.clone(),
            command: ctx.render(cleanup, meta)?,
            cwd: Some(ctx.resolve_dir(spec.chdir.as_deref())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME_AGE_SCRIPT: &str = r#"printf 'Enter your name:\n'; read name; printf 'Hello, %s!\n' "$name"; printf 'Enter your age:\n'; read age; printf 'You are %s years old.\n' "$age""#;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(std::env::temp_dir())
    }

    fn name_age_step() -> ExpectStep {
        ExpectStep::new(ExpectSpec {
            inline: NAME_AGE_SCRIPT.into(),
            responses: vec![
                Response::new("Enter your name:", "{{ args.name }}"),
                Response::new("Enter your age:", "30"),
            ],
            ..Default::default()
        })
    }

    #[test]
    fn test_missing_block() {
        let err = ExpectStep::default().validate(&ctx()).unwrap_err();
        assert_eq!(err.to_string(), "expect block must be provided");
    }

    #[test]
    fn test_missing_inline() {
        let step = ExpectStep::new(ExpectSpec {
            inline: " \n".into(),
            responses: vec![Response::new("x", "y")],
            ..Default::default()
        });
        assert_eq!(
            step.validate(&ctx()).unwrap_err().to_string(),
            "inline must be provided"
        );
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let step = ExpectStep::new(ExpectSpec {
            inline: "cat".into(),
            responses: vec![Response::new("", "y")],
            ..Default::default()
        });
        assert!(matches!(
            step.validate(&ctx()).unwrap_err(),
            StepError::Validation { .. }
        ));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let step = ExpectStep::new(ExpectSpec {
            inline: "cat".into(),
            responses: vec![Response::new("([unclosed", "y")],
            ..Default::default()
        });
        let err = step.validate(&ctx()).unwrap_err();
        assert!(err.to_string().contains("invalid prompt pattern"));
    }

    #[test]
    fn test_valid_step_passes() {
        assert!(name_age_step().validate(&ctx()).is_ok());
    }

    #[test]
    fn test_validate_starts_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let step = ExpectStep::new(ExpectSpec {
            inline: format!("touch {}", marker.display()),
            ..Default::default()
        });
        step.validate(&ctx()).unwrap();
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dialogue_with_rendered_response() {
        let mut context = ctx();
        context.args.insert("name".into(), "John".into());

        let result = name_age_step()
            .execute(&context, &StepMeta::new("greet"))
            .await
            .unwrap();
        assert!(result.stdout.contains("Hello, John!"));
        assert!(result.stdout.contains("You are 30 years old."));
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_is_not_templated() {
        // A literal `{{` in a prompt is a pattern, not a template
        let step = ExpectStep::new(ExpectSpec {
            inline: "printf 'value %s%sx%s%s:\\n' '{' '{' '}' '}'; read v; echo got $v".into(),
            responses: vec![Response::new(r"value \{\{x\}\}:", "ok")],
            ..Default::default()
        });
        let result = step.execute(&ctx(), &StepMeta::new("s")).await.unwrap();
        assert!(result.stdout.contains("got ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_after_dialogue() {
        let step = ExpectStep::new(ExpectSpec {
            inline: "printf 'go:\\n'; read x; exit 2".into(),
            responses: vec![Response::new("go:", "y")],
            ..Default::default()
        });
        let err = step.execute(&ctx(), &StepMeta::new("s")).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::CommandFailed {
                exit_code: Some(2),
                ..
            }
        ));
        assert!(err.permits_cleanup());
    }

    #[test]
    fn test_cleanup_action_uses_chdir() {
        let step = ExpectStep::new(ExpectSpec {
            inline: "true".into(),
            chdir: Some("/var/tmp".into()),
            cleanup: Some("rm -f marker".into()),
            ..Default::default()
        });
        let action = step
            .cleanup_action(&ctx(), &StepMeta::new("s"))
            .unwrap()
            .unwrap();
        assert_eq!(action.command, "rm -f marker");
        assert_eq!(action.cwd.as_deref(), Some(std::path::Path::new("/var/tmp")));
    }
}
