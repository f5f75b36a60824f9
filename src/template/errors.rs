//! Template error types with source locations and suggestions

use std::fmt;
use thiserror::Error;

/// Location in a template where an error occurred
#[derive(Debug, Clone, Default)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}:{}", self.line, self.column)
    }
}

/// Template rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Referenced variable doesn't exist
    #[error("undefined variable '{name}' at {location}{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        name: String,
        location: SourceLocation,
        suggestion: Option<String>,
    },

    /// Template syntax error
    #[error("syntax error at {location}: {message}")]
    SyntaxError {
        message: String,
        location: SourceLocation,
    },

    /// Wrapped minijinja error
    #[error("template error: {0}")]
    Internal(#[from] minijinja::Error),
}

impl TemplateError {
    /// Create an undefined variable error with location and optional suggestion
    pub fn undefined_variable_at(
        name: impl Into<String>,
        line: usize,
        column: usize,
        known_vars: &[&str],
    ) -> Self {
        let name = name.into();
        // Suggest against the last path segment: `args.usr` -> `user`
        let leaf = name.rsplit('.').next().unwrap_or(&name);
        let suggestion = suggest_correction(leaf, known_vars);
        Self::UndefinedVariable {
            name,
            location: SourceLocation { line, column },
            suggestion,
        }
    }

    /// Create a syntax error
    pub fn syntax(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::SyntaxError {
            message: message.into(),
            location: SourceLocation { line, column },
        }
    }
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    let max_distance = (typo.len() / 2).max(2);

    candidates
        .iter()
        .map(|candidate| (levenshtein_distance(typo, candidate), *candidate))
        .filter(|(distance, candidate)| *distance <= max_distance && *candidate != typo)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0usize; b_chars.len() + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }

    #[test]
    fn test_suggest_correction() {
        let candidates = ["password", "username", "target_host"];

        assert_eq!(
            suggest_correction("pasword", &candidates),
            Some("password".into())
        );
        assert_eq!(suggest_correction("completely_different", &candidates), None);
        assert_eq!(suggest_correction("anything", &[]), None);
    }

    #[test]
    fn test_error_display() {
        let err = TemplateError::undefined_variable_at("args.usrname", 1, 7, &["username"]);
        let msg = err.to_string();
        assert!(msg.contains("undefined variable 'args.usrname'"));
        assert!(msg.contains("line 1:7"));
        assert!(msg.contains("did you mean 'username'"));
    }
}
