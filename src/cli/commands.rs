//! CLI command implementations

use super::output::{OutputEvent, OutputHandler, emit_run};
use crate::art::{ArtPaths, Atomic, AtomicSchema, convert_technique_dir};
use crate::config::Ttp;
use crate::runner::TtpRunner;
use crate::signals::CancellationToken;
use crate::step::{EngineSettings, ExecutionContext};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Run a procedure file
pub async fn run_ttp(
    path: &Path,
    args: &[String],
    settings: EngineSettings,
    cancel: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32, String> {
    let ttp = Ttp::load(path).map_err(|e| format!("Failed to load '{}': {}", path.display(), e))?;
    let cli_args = parse_ttp_args(args)?;

    handler.emit(OutputEvent::RunStart {
        name: ttp.name.clone(),
        steps: ttp.steps.len(),
    });

    let runner = TtpRunner::new(settings);
    let result = runner
        .run(&ttp, &cli_args, cancel)
        .await
        .map_err(|e| format!("Failed to start '{}': {}", ttp.name, e))?;

    emit_run(handler, &result);

    // The last executed step's output is the run's output
    let final_output = result
        .steps
        .iter()
        .rev()
        .find_map(|record| result.outputs.get(&record.name))
        .map(|output| output.stdout.trim_end());
    handler.result(result.success(), final_output);

    Ok(if result.success() { 0 } else { 1 })
}

/// Parse `key=value` arguments
fn parse_ttp_args(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut parsed = HashMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("argument '{}' must be of the form key=value", arg))?;
        if key.trim().is_empty() {
            return Err(format!("argument '{}' has an empty name", arg));
        }
        parsed.insert(key.trim().to_string(), value.to_string());
    }
    Ok(parsed)
}

/// Load a procedure and validate every step without running anything
pub fn validate_ttp(path: &Path, handler: &dyn OutputHandler) -> i32 {
    let ttp = match Ttp::load(path) {
        Ok(ttp) => ttp,
        Err(e) => {
            handler.emit(OutputEvent::RunError {
                error: format!("Failed to load '{}': {}", path.display(), e),
            });
            return 1;
        }
    };

    let ctx = ExecutionContext::new(ttp.workdir.clone());
    let errors: Vec<String> = ttp
        .steps
        .iter()
        .filter_map(|step| {
            step.validate(&ctx)
                .err()
                .map(|e| format!("{}: {}", step.name(), e))
        })
        .collect();

    if errors.is_empty() {
        handler.emit(OutputEvent::Info {
            message: format!("✓ Procedure '{}' is valid ({} steps)", ttp.name, ttp.steps.len()),
        });
        0
    } else {
        handler.emit(OutputEvent::Info {
            message: format!("✗ Procedure '{}' has {} error(s):", ttp.name, errors.len()),
        });
        for error in errors {
            handler.emit(OutputEvent::Info {
                message: format!("  - {}", error),
            });
        }
        1
    }
}

/// Where converted techniques land when nothing else is configured
pub fn default_output_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ttpforge/repos/forgearmory/ttps/art"))
}

/// Convert a technique directory into a procedure.
///
/// With `art_config`, `technique` is an identifier looked up under the
/// configured corpus; otherwise it is a directory path.
pub fn convert_technique(
    technique: &str,
    art_config: Option<&Path>,
    output_root: &Path,
    handler: &dyn OutputHandler,
) -> Result<i32, String> {
    let dir = match art_config {
        Some(config) => ArtPaths::load(config)
            .map_err(|e| e.to_string())?
            .technique_dir(technique),
        None => PathBuf::from(technique),
    };

    let written = convert_technique_dir(&dir, output_root).map_err(|e| e.to_string())?;
    handler.emit(OutputEvent::Info {
        message: format!("✓ Wrote {}", written.display()),
    });
    handler.result(true, Some(&written.display().to_string()));
    Ok(0)
}

#[derive(Serialize)]
struct AbilityExport<'a> {
    ability_id: i64,
    abilities: &'a [crate::art::Ability],
    vars: &'a [crate::art::Var],
}

/// Encode an ability record, optionally expanding a technique file's tests
pub fn generate_abilities(
    record: &Path,
    technique: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32, String> {
    let mut atomic = Atomic::load(record).map_err(|e| e.to_string())?;

    match technique {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
            let schema: AtomicSchema = serde_yaml::from_str(&text)
                .map_err(|e| format!("Failed to parse '{}': {}", path.display(), e))?;
            for test in &schema.atomic_tests {
                atomic.process_atomic_test(test);
            }
        }
        None => atomic.generate_abilities_and_vars(),
    }

    let export = AbilityExport {
        ability_id: atomic.ability_id,
        abilities: &atomic.abilities,
        vars: &atomic.vars,
    };
    let json = serde_json::to_string_pretty(&export).map_err(|e| e.to_string())?;
    handler.result(true, Some(&json));
    Ok(0)
}
