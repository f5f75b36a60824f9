//! Errors raised while loading a procedure and resolving its arguments

use std::path::PathBuf;
use thiserror::Error;

/// Problems with a procedure document, found before any step runs
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("procedure name must be provided")]
    MissingName,

    #[error("step {index} has no name")]
    EmptyStepName { index: usize },

    #[error("duplicate step name '{name}'")]
    DuplicateStep { name: String },

    #[error("step '{step}' sets both inline and expect")]
    AmbiguousStep { step: String },

    #[error("step '{step}' must set either inline or expect")]
    MissingPayload { step: String },

    #[error("step '{step}': {field} belongs inside the expect block")]
    MisplacedField { step: String, field: &'static str },

    #[error("argument '{name}' has no value and no default")]
    MissingArgument { name: String },

    #[error("unknown argument '{name}'")]
    UnknownArgument { name: String },

    #[error("argument '{name}' expects {arg_type}, got {value:?}")]
    InvalidArgument {
        name: String,
        arg_type: String,
        value: String,
    },
}

impl LoadError {
    pub fn parse(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
