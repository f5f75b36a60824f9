//! Attack-technique test corpus bridge
//!
//! Two forms are supported: whole technique files converted into procedure
//! documents, and per-test JSON records turned into base64-encoded
//! ability/variable pairs for a downstream store.

mod abilities;
mod convert;

pub use abilities::{Ability, ArtPaths, Atomic, Var};
pub use convert::convert_technique_dir;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from reading, converting or writing technique data
#[derive(Debug, Error)]
pub enum ArtError {
    #[error("a valid technique path must be provided")]
    EmptyPath,

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize procedure: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("decoded payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl ArtError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A technique file: one technique, many tests
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AtomicSchema {
    pub attack_technique: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub atomic_tests: Vec<AtomicTest>,
}

/// One test inside a technique file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AtomicTest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub supported_platforms: Vec<String>,
    #[serde(default)]
    pub input_arguments: BTreeMap<String, InputArgument>,
    #[serde(default)]
    pub executor: Executor,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Executor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub cleanup_command: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputArgument {
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub arg_type: String,
    #[serde(default)]
    pub default: serde_yaml::Value,
}

impl InputArgument {
    /// The default rendered as plain text; null becomes empty
    pub fn default_text(&self) -> String {
        match &self.default {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            other => serde_yaml::to_string(other)
                .map(|s| s.trim_end().to_string())
                .unwrap_or_default(),
        }
    }
}
