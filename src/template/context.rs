//! Template context for variable resolution

use crate::step::StepResult;
use minijinja::value::{Object, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Context available to command templates during rendering
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Results from completed steps, keyed by step name
    pub steps: HashMap<String, StepResult>,

    /// Resolved procedure arguments
    pub args: HashMap<String, String>,

    /// Environment overrides, consulted before the process environment
    pub env: HashMap<String, String>,
}

impl TemplateContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with resolved arguments
    pub fn with_args(args: HashMap<String, String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Add a step result to the context
    pub fn add_step(&mut self, name: impl Into<String>, result: StepResult) {
        self.steps.insert(name.into(), result);
    }

    /// Convert to a minijinja Value for template rendering
    pub fn to_value(&self) -> Value {
        Value::from_object(ContextObject(self.clone()))
    }

    /// Known names for error suggestions: top-level variables, argument and step names
    pub fn known_variables(&self) -> Vec<&str> {
        let mut vars = vec!["steps", "args", "env"];
        vars.extend(self.args.keys().map(|k| k.as_str()));
        vars.extend(self.steps.keys().map(|k| k.as_str()));
        vars
    }
}

#[derive(Debug, Clone)]
struct ContextObject(TemplateContext);

impl fmt::Display for ContextObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemplateContext")
    }
}

impl Object for ContextObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "steps" => Some(Value::from_object(StepsObject(self.0.steps.clone()))),
            "args" => Some(Value::from_object(ArgsObject(self.0.args.clone()))),
            "env" => Some(Value::from_object(EnvObject(self.0.env.clone()))),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Str(&["steps", "args", "env"])
    }
}

#[derive(Debug, Clone)]
struct StepsObject(HashMap<String, StepResult>);

impl fmt::Display for StepsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "steps")
    }
}

impl Object for StepsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let result = self.0.get(key.as_str()?)?;
        Some(Value::from_object(StepResultObject(result.clone())))
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Values(
            self.0.keys().map(|k| Value::from(k.clone())).collect(),
        )
    }
}

/// A single step result; renders as its trimmed stdout
#[derive(Debug, Clone)]
struct StepResultObject(StepResult);

impl fmt::Display for StepResultObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.stdout.trim())
    }
}

impl Object for StepResultObject {
    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        f.write_str(self.0.stdout.trim())
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "stdout" => Some(Value::from(self.0.stdout.trim().to_string())),
            "stderr" => Some(Value::from(self.0.stderr.trim().to_string())),
            "exit_code" => self.0.exit_code.map(|c| Value::from(c as i64)),
            "success" => Some(Value::from(self.0.success)),
            "duration_ms" => Some(Value::from(self.0.duration_ms as i64)),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Str(&[
            "stdout",
            "stderr",
            "exit_code",
            "success",
            "duration_ms",
        ])
    }
}

#[derive(Debug, Clone)]
struct ArgsObject(HashMap<String, String>);

impl fmt::Display for ArgsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "args")
    }
}

impl Object for ArgsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        self.0.get(key.as_str()?).map(|v| Value::from(v.clone()))
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        minijinja::value::Enumerator::Values(
            self.0.keys().map(|k| Value::from(k.clone())).collect(),
        )
    }
}

/// Environment lookup: overrides first, then the process environment
#[derive(Debug, Clone)]
struct EnvObject(HashMap<String, String>);

impl fmt::Display for EnvObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env")
    }
}

impl Object for EnvObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let var_name = key.as_str()?;
        self.0
            .get(var_name)
            .cloned()
            .or_else(|| std::env::var(var_name).ok())
            .map(Value::from)
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        // Don't enumerate env vars - too many and potentially sensitive
        minijinja::value::Enumerator::Empty
    }
}
