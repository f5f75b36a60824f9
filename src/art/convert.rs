//! Technique files to procedure documents

use super::{ArtError, AtomicSchema};
use crate::config::{ArgSpec, MitreInfo, StepConfig, TtpConfig};
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([^{}\s]+)\}").expect("placeholder pattern is valid"));

/// Lowercase and dash-separate a display name: "Test Name" -> "test-name"
pub fn format_step_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

/// Rewrite `#{arg}` placeholders into template references
pub fn rewrite_placeholders(text: &str) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                format!("{{{{ args.{} }}}}", name)
            } else {
                format!("{{{{ args[{:?}] }}}}", name)
            }
        })
        .into_owned()
}

/// Map a technique file onto a procedure: one command step per test
pub fn convert_schema(atomic: &AtomicSchema) -> TtpConfig {
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(atomic.atomic_tests.len());

    for test in &atomic.atomic_tests {
        if test.executor.command.trim().is_empty() {
            tracing::warn!(
                test = %test.name,
                executor = %test.executor.name,
                "test has no command, skipping"
            );
            continue;
        }

        let base = format_step_name(&test.name);
        let mut name = base.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{}-{}", base, n);
            n += 1;
        }

        // input_arguments is ordered by name
        let args = test
            .input_arguments
            .iter()
            .map(|(arg_name, input)| ArgSpec {
                name: arg_name.clone(),
                arg_type: Some(input.arg_type.clone()).filter(|t| !t.is_empty()),
                default: Some(input.default_text()),
                description: Some(input.description.clone()).filter(|d| !d.is_empty()),
            })
            .collect();

        let cleanup = Some(test.executor.cleanup_command.trim())
            .filter(|c| !c.is_empty())
            .map(rewrite_placeholders);

        steps.push(StepConfig {
            name,
            description: Some(test.description.clone()).filter(|d| !d.is_empty()),
            supported_platforms: test
                .supported_platforms
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            args,
            inline: Some(rewrite_placeholders(&test.executor.command)),
            chdir: None,
            cleanup,
            expect: None,
        });
    }

    TtpConfig {
        name: format_step_name(&atomic.display_name),
        description: atomic.display_name.clone(),
        mitre: Some(MitreInfo {
            techniques: vec![atomic.attack_technique.clone()],
        }),
        args: Vec::new(),
        env: Default::default(),
        steps,
    }
}

/// Convert `<dir>/<base>.yaml` into `<output_root>/<base>/<base>.yaml`.
///
/// A `src` directory next to the technique file is copied alongside.
/// Returns the path of the written procedure.
pub fn convert_technique_dir(dir: &Path, output_root: &Path) -> Result<PathBuf, ArtError> {
    if dir.as_os_str().is_empty() {
        return Err(ArtError::EmptyPath);
    }
    let base = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(ArtError::EmptyPath)?;

    let source = dir.join(format!("{}.yaml", base));
    let text = std::fs::read_to_string(&source).map_err(|e| ArtError::io(&source, e))?;
    let atomic: AtomicSchema = serde_yaml::from_str(&text).map_err(|e| ArtError::Parse {
        path: source.clone(),
        message: e.to_string(),
    })?;

    let ttp = convert_schema(&atomic);
    let yaml = ttp.to_yaml()?;

    let output_dir = output_root.join(base);
    std::fs::create_dir_all(&output_dir).map_err(|e| ArtError::io(&output_dir, e))?;
    let output_file = output_dir.join(format!("{}.yaml", base));
    std::fs::write(&output_file, yaml).map_err(|e| ArtError::io(&output_file, e))?;

    let src = dir.join("src");
    if src.is_dir() {
        copy_dir(&src, &output_dir.join("src"))?;
    }

    tracing::info!(
        technique = %atomic.attack_technique,
        steps = ttp.steps.len(),
        path = %output_file.display(),
        "converted technique"
    );
    Ok(output_file)
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), ArtError> {
    std::fs::create_dir_all(dst).map_err(|e| ArtError::io(dst, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| ArtError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ArtError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| ArtError::io(&from, e))?;
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| ArtError::io(&from, e))?;
        }
    }
    Ok(())
}
