//! Procedure runner: the forward pass followed by teardown

mod state;

pub use state::{RunResult, RunState};

use crate::cleanup::{CleanupPolicy, merge_reports};
use crate::config::{LoadError, Ttp};
use crate::signals::CancellationToken;
use crate::step::{EngineSettings, ExecutionContext, StepState};
use std::collections::HashMap;
use std::time::Instant;

/// Name of the running OS as used in `supported_platforms`
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}

/// Runs procedures one step at a time
#[derive(Debug, Clone)]
pub struct TtpRunner {
    settings: EngineSettings,
    platform: String,
}

impl TtpRunner {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            platform: current_platform().to_string(),
        }
    }

    /// Override the platform used for step filtering
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Run a procedure.
    ///
    /// Each step is validated then executed, in order; the first error stops
    /// the forward pass. Registered cleanups always run afterwards, even when
    /// the run failed or was cancelled. Only argument resolution can fail
    /// the call itself; step failures are reported in the result.
    pub async fn run(
        &self,
        ttp: &Ttp,
        cli_args: &HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<RunResult, LoadError> {
        let args = ttp.resolve_args(cli_args)?;

        let mut ctx = ExecutionContext::new(ttp.workdir.clone())
            .with_settings(self.settings.clone())
            .with_args(args)
            .with_env(ttp.env.clone())
            .with_cancel(cancel.clone());
        let executor = ctx.cleanup_executor();
        let mut state = RunState::new(ttp);
        let mut reports = Vec::new();

        tracing::info!(
            procedure = %ttp.name,
            steps = ttp.steps.len(),
            policy = ?self.settings.cleanup_policy,
            "starting procedure"
        );

        for (index, step) in ttp.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(step = %step.name(), "run cancelled, skipping remaining steps");
                state.cancel_before(index);
                break;
            }

            if !step.meta.runs_on(&self.platform) {
                tracing::info!(
                    step = %step.name(),
                    platform = %self.platform,
                    "step not supported on this platform, skipping"
                );
                state.set(index, StepState::Skipped);
                continue;
            }

            let started = Instant::now();
            if let Err(e) = step.validate(&ctx) {
                tracing::error!(step = %step.name(), error = %e, "validation failed");
                state.fail(index, e, started.elapsed());
                break;
            }
            state.set(index, StepState::Validated);

            let mark = ctx.ledger.mark();
            tracing::info!(step = %step.name(), kind = step.kind.name(), "executing step");

            match step.execute(&mut ctx).await {
                Ok(result) => {
                    tracing::info!(
                        step = %step.name(),
                        duration_ms = result.duration_ms,
                        "step completed"
                    );
                    state.executed(index, started.elapsed());
                }
                Err(e) => {
                    tracing::error!(
                        step = %step.name(),
                        kind = e.kind(),
                        error = %e,
                        "step failed"
                    );
                    state.fail(index, e, started.elapsed());
                }
            }

            if self.settings.cleanup_policy == CleanupPolicy::Immediate {
                reports.push(ctx.ledger.unwind_from(mark, &executor).await);
            }

            if state.failed() {
                break;
            }
        }

        if ctx.ledger.pending() > 0 {
            tracing::info!(pending = ctx.ledger.pending(), "running cleanup");
        }
        reports.push(ctx.ledger.teardown(&executor).await);

        let report = merge_reports(reports);
        state.apply_cleanup(&ctx.ledger);

        let result = RunResult::from_state(state, std::mem::take(&mut ctx.outputs), report);
        tracing::info!(
            procedure = %result.name,
            success = result.success(),
            cleanup_failures = result.cleanup_failures.len(),
            duration_ms = result.duration.as_millis() as u64,
            "procedure finished"
        );
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::TtpConfig;
    use crate::step::StepError;
    use std::path::Path;
    use tempfile::TempDir;

    fn load(dir: &TempDir, yaml: &str) -> Ttp {
        TtpConfig::from_yaml(yaml, Path::new("ttp.yaml"))
            .unwrap()
            .build(dir.path().to_path_buf())
            .unwrap()
    }

    fn runner(policy: CleanupPolicy) -> TtpRunner {
        TtpRunner::new(EngineSettings {
            cleanup_policy: policy,
            ..Default::default()
        })
        .with_platform("linux")
    }

    fn log_lines(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    const THREE_STEPS: &str = r#"
name: three
steps:
  - name: one
    inline: echo run-one >> log
    cleanup: echo clean-one >> log
  - name: two
    inline: echo run-two >> log
    cleanup: echo clean-two >> log
  - name: three
    inline: echo run-three >> log
    cleanup: echo clean-three >> log
"#;

    #[tokio::test]
    async fn test_cleanup_runs_in_reverse_after_forward_pass() {
        let dir = TempDir::new().unwrap();
        let ttp = load(&dir, THREE_STEPS);

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(
            log_lines(&dir),
            vec![
                "run-one",
                "run-two",
                "run-three",
                "clean-three",
                "clean-two",
                "clean-one"
            ]
        );
        assert_eq!(result.cleanups_run, vec!["three", "two", "one"]);
        assert!(result.steps.iter().all(|s| s.state == StepState::CleanedUp));
    }

    #[tokio::test]
    async fn test_immediate_policy_interleaves_cleanup() {
        let dir = TempDir::new().unwrap();
        let ttp = load(&dir, THREE_STEPS);

        let result = runner(CleanupPolicy::Immediate)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(
            log_lines(&dir),
            vec![
                "run-one",
                "clean-one",
                "run-two",
                "clean-two",
                "run-three",
                "clean-three"
            ]
        );
        // Each entry drained exactly once
        assert_eq!(result.cleanups_run.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_forward_pass_but_not_teardown() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: failing
steps:
  - name: setup
    inline: echo setup >> log
    cleanup: echo undo-setup >> log
  - name: broken
    inline: echo broken >> log; exit 7
    cleanup: echo undo-broken >> log
  - name: never
    inline: echo never >> log
"#,
        );

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success());
        assert_eq!(result.failed_step.as_deref(), Some("broken"));
        assert_eq!(result.outputs["broken"].exit_code, Some(7));
        assert!(matches!(
            result.error,
            Some(StepError::CommandFailed {
                exit_code: Some(7),
                ..
            })
        ));
        assert_eq!(
            log_lines(&dir),
            vec!["setup", "broken", "undo-broken", "undo-setup"]
        );
        assert_eq!(result.step("never").unwrap().state, StepState::Unvalidated);
    }

    #[tokio::test]
    async fn test_validation_failure_registers_no_cleanup() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: invalid
steps:
  - name: setup
    inline: echo setup >> log
    cleanup: echo undo-setup >> log
  - name: empty
    expect:
"#,
        );

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result.error.as_ref().unwrap().to_string(),
            "expect block must be provided"
        );
        assert_eq!(log_lines(&dir), vec!["setup", "undo-setup"]);
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_aggregated() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: messy
steps:
  - name: a
    inline: "true"
    cleanup: exit 1
  - name: b
    inline: "true"
    cleanup: echo clean-b >> log
  - name: c
    inline: "true"
    cleanup: exit 2
"#,
        );

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.error.is_none());
        assert!(!result.success());
        assert_eq!(result.cleanup_failures.len(), 2);
        assert_eq!(result.cleanup_failures[0].step, "c");
        assert_eq!(result.cleanup_failures[1].step, "a");
        assert_eq!(log_lines(&dir), vec!["clean-b"]);
        assert_eq!(result.step("a").unwrap().state, StepState::CleanupFailed);
    }

    #[tokio::test]
    async fn test_platform_filter_skips_step() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: platforms
steps:
  - name: win
    supported_platforms: [windows]
    inline: echo win >> log
  - name: nix
    supported_platforms: [linux, darwin]
    inline: echo nix >> log
"#,
        );

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.step("win").unwrap().state, StepState::Skipped);
        assert_eq!(log_lines(&dir), vec!["nix"]);
    }

    #[tokio::test]
    async fn test_outputs_flow_between_steps() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: chained
args:
  - name: greeting
    default: hi
steps:
  - name: who
    inline: echo operator
  - name: greet
    inline: echo "{{ args.greeting }} {{ steps.who.stdout }}" >> log
"#,
        );

        let mut cli = HashMap::new();
        cli.insert("greeting".to_string(), "hello".to_string());

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &cli, CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(log_lines(&dir), vec!["hello operator"]);
        assert_eq!(result.outputs["who"].stdout, "operator\n");
    }

    #[tokio::test]
    async fn test_interactive_step_in_procedure() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: interactive
steps:
  - name: dialogue
    expect:
      inline: printf 'Enter your name:\n'; read name; printf 'Hello, %s!\n' "$name"
      responses:
        - prompt: "Enter your name:"
          response: John
      cleanup: echo clean-dialogue >> log
"#,
        );

        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success(), "{:?}", result.error);
        assert!(result.outputs["dialogue"].stdout.contains("Hello, John!"));
        assert_eq!(log_lines(&dir), vec!["clean-dialogue"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_still_tears_down() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            r#"
name: cancelled
steps:
  - name: setup
    inline: echo setup >> log
    cleanup: echo undo-setup >> log
  - name: slow
    inline: sleep 30
    cleanup: echo undo-slow >> log
  - name: never
    inline: echo never >> log
"#,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(matches!(result.error, Some(StepError::Cancelled)));
        assert_eq!(log_lines(&dir), vec!["setup", "undo-slow", "undo-setup"]);
    }

    #[tokio::test]
    async fn test_missing_argument_fails_before_running() {
        let dir = TempDir::new().unwrap();
        let ttp = load(
            &dir,
            "name: t\nargs:\n  - name: target\nsteps:\n  - name: a\n    inline: echo a >> log\n",
        );

        let err = runner(CleanupPolicy::Deferred)
            .run(&ttp, &HashMap::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::MissingArgument { .. }));
        assert!(log_lines(&dir).is_empty());
    }
}
