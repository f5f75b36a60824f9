//! Custom template filters

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};

/// Register all custom filters with a minijinja Environment
pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("shell_escape", filter_shell_escape);
    env.add_filter("json", filter_json);
    env.add_filter("b64encode", filter_b64encode);
    env.add_filter("b64decode", filter_b64decode);
}

/// Escape a string for safe shell interpolation
///
/// Uses single quotes and escapes any embedded single quotes.
/// Example: `hello 'world'` becomes `'hello '\''world'\''`
fn filter_shell_escape(_state: &State, value: Value) -> Result<Value, Error> {
    let s = value.to_string();

    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        return Ok(Value::from(s));
    }

    let mut escaped = String::with_capacity(s.len() + 10);
    escaped.push('\'');
    for c in s.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');

    Ok(Value::from(escaped))
}

/// Serialize value to JSON string
fn filter_json(_state: &State, value: Value) -> Result<Value, Error> {
    let json = serde_json::to_string(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("JSON serialization failed: {}", e),
        )
    })?;
    Ok(Value::from(json))
}

/// Standard base64 of the value's string form
fn filter_b64encode(_state: &State, value: Value) -> Result<Value, Error> {
    Ok(Value::from(STANDARD.encode(value.to_string())))
}

/// Decode standard base64 into text
fn filter_b64decode(_state: &State, value: Value) -> Result<Value, Error> {
    let bytes = STANDARD.decode(value.to_string()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid base64: {}", e),
        )
    })?;
    let text = String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("decoded base64 is not UTF-8: {}", e),
        )
    })?;
    Ok(Value::from(text))
}
