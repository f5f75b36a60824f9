//! Shared state threaded through a procedure run

use super::{StepError, StepMeta, StepResult};
use crate::cleanup::{CleanupLedger, CleanupPolicy, ShellCleanupExecutor};
use crate::signals::CancellationToken;
use crate::template::{TemplateContext, TemplateEngine};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Effective engine settings for one run
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Shell used for `-c` invocations
    pub shell: String,
    pub command_timeout: Duration,
    /// Ceiling for an interactive dialogue
    pub expect_timeout: Duration,
    /// Bound on a single prompt wait
    pub prompt_timeout: Option<Duration>,
    pub cleanup_policy: CleanupPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            command_timeout: Duration::from_secs(300),
            expect_timeout: Duration::from_secs(60),
            prompt_timeout: None,
            cleanup_policy: CleanupPolicy::Deferred,
        }
    }
}

/// Everything a step can see while it validates, executes or cleans up
#[derive(Debug)]
pub struct ExecutionContext {
    /// Directory relative paths are resolved against
    pub workdir: PathBuf,
    /// Environment passed to every subprocess, on top of the inherited one
    pub env: HashMap<String, String>,
    /// Resolved procedure arguments; also carries CLI values for step-scoped ones
    pub args: HashMap<String, String>,
    /// Results of executed steps, keyed by step name
    pub outputs: HashMap<String, StepResult>,
    pub ledger: CleanupLedger,
    pub settings: EngineSettings,
    pub cancel: CancellationToken,
    templates: TemplateEngine,
}

impl ExecutionContext {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            env: HashMap::new(),
            args: HashMap::new(),
            outputs: HashMap::new(),
            ledger: CleanupLedger::new(),
            settings: EngineSettings::default(),
            cancel: CancellationToken::new(),
            templates: TemplateEngine::new(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    pub fn output(&self, step: &str) -> Option<&StepResult> {
        self.outputs.get(step)
    }

    pub fn record_output(&mut self, step: &str, result: StepResult) {
        self.outputs.insert(step.to_string(), result);
    }

    /// Template context for `meta`: step defaults underneath resolved arguments
    pub fn template_context(&self, meta: &StepMeta) -> TemplateContext {
        let mut args: HashMap<String, String> = meta
            .args
            .iter()
            .filter_map(|a| a.default.clone().map(|d| (a.name.clone(), d)))
            .collect();
        args.extend(self.args.iter().map(|(k, v)| (k.clone(), v.clone())));

        TemplateContext {
            steps: self.outputs.clone(),
            args,
            env: self.env.clone(),
        }
    }

    /// Render command text for `meta`
    pub fn render(&self, text: &str, meta: &StepMeta) -> Result<String, StepError> {
        let ctx = self.template_context(meta);
        Ok(self.templates.render(text, &ctx)?)
    }

    /// Resolve an optional working-directory override against `workdir`
    pub fn resolve_dir(&self, chdir: Option<&str>) -> PathBuf {
        match chdir {
            Some(dir) if !dir.trim().is_empty() => {
                let expanded = shellexpand::tilde(dir);
                let path = Path::new(expanded.as_ref());
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.workdir.join(path)
                }
            }
            _ => self.workdir.clone(),
        }
    }

    /// Executor the ledger uses to run teardown commands
    pub fn cleanup_executor(&self) -> ShellCleanupExecutor {
        ShellCleanupExecutor {
            shell: self.settings.shell.clone(),
            cwd: self.workdir.clone(),
            env: self.env.clone(),
            timeout: self.settings.command_timeout,
        }
    }
}
