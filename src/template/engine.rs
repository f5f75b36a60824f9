//! Template engine for rendering command text

use super::context::TemplateContext;
use super::errors::TemplateError;
use super::filters;
use minijinja::Environment;

/// Template rendering engine
///
/// Wraps minijinja with custom filters and strict undefined handling.
#[derive(Clone)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Render a template string with the given context
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        // Fast path: most commands carry no template syntax at all
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }

        self.env
            .render_str(template, ctx.to_value())
            .map_err(|e| convert_minijinja_error(e, template, ctx))
    }

    /// Check if a template is syntactically valid
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        let mut env = self.env.clone();
        env.add_template("__validate__", template)
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0), 0))?;
        Ok(())
    }
}

fn convert_minijinja_error(
    err: minijinja::Error,
    template: &str,
    ctx: &TemplateContext,
) -> TemplateError {
    let msg = err.to_string();
    let line = err.line().unwrap_or(0);

    match err.kind() {
        minijinja::ErrorKind::UndefinedError => {
            let var_name = err
                .range()
                .and_then(|r| template.get(r))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| extract_var_from_error(&msg));
            return TemplateError::undefined_variable_at(var_name, line, 0, &ctx.known_variables());
        }
        minijinja::ErrorKind::SyntaxError => return TemplateError::syntax(msg, line, 0),
        _ => {}
    }

    TemplateError::Internal(err)
}

/// Extract a backtick-quoted name from a minijinja error message
fn extract_var_from_error(msg: &str) -> String {
    msg.split('`')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepResult;
    use std::collections::HashMap;

    #[test]
    fn test_plain_text_passthrough() {
        let engine = TemplateEngine::new();
        let ctx = TemplateContext::new();
        assert_eq!(engine.render("id -u\n", &ctx).unwrap(), "id -u\n");
    }

    #[test]
    fn test_render_with_args() {
        let engine = TemplateEngine::new();
        let mut args = HashMap::new();
        args.insert("user".into(), "bobbo".into());
        let ctx = TemplateContext::with_args(args);

        let result = engine.render("ssh {{ args.user }}@k8s6\n", &ctx).unwrap();
        assert_eq!(result, "ssh bobbo@k8s6\n");
    }

    #[test]
    fn test_render_with_step_output() {
        let engine = TemplateEngine::new();
        let mut ctx = TemplateContext::new();
        ctx.add_step("whoami", StepResult::success("root\n".into(), 3));

        assert_eq!(
            engine.render("echo {{ steps.whoami.stdout }}", &ctx).unwrap(),
            "echo root"
        );
        assert_eq!(
            engine.render("echo {{ steps.whoami }}", &ctx).unwrap(),
            "echo root"
        );
    }

    #[test]
    fn test_render_env_override() {
        let engine = TemplateEngine::new();
        let mut ctx = TemplateContext::new();
        ctx.env.insert("TTP_TARGET".into(), "host-a".into());

        assert_eq!(engine.render("{{ env.TTP_TARGET }}", &ctx).unwrap(), "host-a");
    }

    #[test]
    fn test_undefined_variable_error() {
        let engine = TemplateEngine::new();
        let ctx = TemplateContext::new();

        let err = engine.render("{{ args.nonexistent }}", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::UndefinedVariable { .. }));
    }

    #[test]
    fn test_syntax_error() {
        let engine = TemplateEngine::new();
        let ctx = TemplateContext::new();
        assert!(engine.render("{{ invalid syntax {{", &ctx).is_err());
        assert!(engine.validate("echo {{ args.x }").is_err());
        assert!(engine.validate("echo {{ args.x }}").is_ok());
    }
}
