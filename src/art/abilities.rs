//! Encoded ability and variable records

use super::{ArtError, AtomicTest};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const PLATFORMS: &[&str] = &["windows", "linux", "macos"];

/// Locations of the technique corpus and the threat-intel corpus
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArtPaths {
    #[serde(default)]
    pub art_path: PathBuf,
    #[serde(default)]
    pub cti_path: PathBuf,
}

impl ArtPaths {
    pub fn load(path: &Path) -> Result<Self, ArtError> {
        let text = std::fs::read_to_string(path).map_err(|e| ArtError::io(path, e))?;
        serde_yaml::from_str(&text).map_err(|e| ArtError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Directory holding a technique's files, e.g. `<art_path>/atomics/T1003`
    pub fn technique_dir(&self, technique: &str) -> PathBuf {
        self.art_path.join("atomics").join(technique)
    }
}

/// A command bound to an ability, base64-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ability {
    pub ability_id: i64,
    pub command: String,
}

impl Ability {
    pub fn new(ability_id: i64, command: &str) -> Self {
        Self {
            ability_id,
            command: STANDARD.encode(command),
        }
    }

    pub fn decode_command(&self) -> Result<String, ArtError> {
        Ok(String::from_utf8(STANDARD.decode(&self.command)?)?)
    }
}

/// A named input value bound to an ability, base64-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Var {
    pub ability_id: i64,
    pub var_name: String,
    pub value: String,
}

impl Var {
    pub fn new(ability_id: i64, var_name: impl Into<String>, value: &str) -> Self {
        Self {
            ability_id,
            var_name: var_name.into(),
            value: STANDARD.encode(value),
        }
    }

    pub fn decode_value(&self) -> Result<String, ArtError> {
        Ok(String::from_utf8(STANDARD.decode(&self.value)?)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Argument {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default: String,
}

/// One test record as exported by the ability store
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Atomic {
    pub ability_id: i64,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub executor: String,
    #[serde(default)]
    pub command: String,
    #[serde(rename = "InputArguments", alias = "input_arguments", default)]
    pub input_arguments: BTreeMap<String, Argument>,
    #[serde(default)]
    pub encoder: Vec<String>,
    #[serde(skip_deserializing)]
    pub abilities: Vec<Ability>,
    #[serde(skip_deserializing)]
    pub vars: Vec<Var>,
}

impl Atomic {
    pub fn new(ability_id: i64) -> Self {
        Self {
            ability_id,
            ..Default::default()
        }
    }

    /// Read a JSON record
    pub fn load(path: &Path) -> Result<Self, ArtError> {
        let text = std::fs::read_to_string(path).map_err(|e| ArtError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| ArtError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Encode the record's own command plus one var per input argument.
    ///
    /// The command is encoded as-is; argument defaults are normalized first.
    pub fn generate_abilities_and_vars(&mut self) {
        for (name, arg) in &self.input_arguments {
            let value = replace_special_chars(&arg.default);
            self.vars.push(Var::new(self.ability_id, name, &value));
        }
        self.abilities.push(Ability::new(self.ability_id, &self.command));
    }

    /// Add one ability (and its vars) per supported platform of `test`
    pub fn process_atomic_test(&mut self, test: &AtomicTest) {
        for platform in &test.supported_platforms {
            let platform = platform.to_lowercase();
            if !PLATFORMS.contains(&platform.as_str()) {
                tracing::debug!(test = %test.name, %platform, "unsupported platform, skipping");
                continue;
            }

            let command = replace_special_chars(&test.executor.command);
            self.abilities.push(Ability::new(self.ability_id, &command));

            for (name, arg) in &test.input_arguments {
                let value = replace_special_chars(&arg.default_text());
                self.vars.push(Var::new(self.ability_id, name, &value));
            }
        }
    }
}

/// Undo escape damage from YAML round-trips: BEL becomes `a`, doubled
/// backslashes collapse
pub fn replace_special_chars(text: &str) -> String {
    text.replace('\x07', "a").replace("\\\\", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_case(platforms: &[&str]) -> AtomicTest {
        serde_yaml::from_str(&format!(
            r#"
name: Registry dump
supported_platforms: [{}]
input_arguments:
  output_file:
    type: path
    default: C:\\temp\\out.txt
  hive:
    type: string
    default: HKLM
executor:
  name: command_prompt
  command: 'reg save #{{hive}} #{{output_file}}'
"#,
            platforms.join(", ")
        ))
        .unwrap()
    }

    #[test]
    fn test_replace_special_chars() {
        assert_eq!(replace_special_chars("\x07bc"), "abc");
        assert_eq!(replace_special_chars(r"C:\\Windows\\Temp"), r"C:\Windows\Temp");
        assert_eq!(replace_special_chars("plain"), "plain");
    }

    #[test]
    fn test_encoding_round_trips() {
        let ability = Ability::new(7, "whoami /all");
        assert_eq!(ability.command, "d2hvYW1pIC9hbGw=");
        assert_eq!(ability.decode_command().unwrap(), "whoami /all");

        let var = Var::new(7, "user", "ÿ admin");
        assert_eq!(var.decode_value().unwrap(), "ÿ admin");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let ability = Ability {
            ability_id: 1,
            command: "not base64!".into(),
        };
        assert!(matches!(ability.decode_command(), Err(ArtError::Decode(_))));
    }

    #[test]
    fn test_process_atomic_test_filters_platforms() {
        let mut atomic = Atomic::new(42);
        atomic.process_atomic_test(&test_case(&["Windows", "amiga", "macos"]));

        assert_eq!(atomic.abilities.len(), 2);
        assert_eq!(atomic.vars.len(), 4);
        assert!(atomic.abilities.iter().all(|a| a.ability_id == 42));
        assert_eq!(
            atomic.abilities[0].decode_command().unwrap(),
            "reg save #{hive} #{output_file}"
        );
        let output = atomic
            .vars
            .iter()
            .find(|v| v.var_name == "output_file")
            .unwrap();
        assert_eq!(output.decode_value().unwrap(), r"C:\temp\out.txt");
    }

    #[test]
    fn test_unsupported_platforms_yield_nothing() {
        let mut atomic = Atomic::new(1);
        atomic.process_atomic_test(&test_case(&["amiga", "containers"]));
        assert!(atomic.abilities.is_empty());
        assert!(atomic.vars.is_empty());
    }

    #[test]
    fn test_load_and_generate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("atomic.json");
        std::fs::write(
            &path,
            r#"{
  "ability_id": 9,
  "platform": "windows",
  "executor": "psh",
  "command": "dir C:\\\\Users",
  "InputArguments": {
    "target": {"id": 1, "name": "target", "default": "C:\\\\Users\\\\Public"}
  },
  "encoder": ["base64"]
}"#,
        )
        .unwrap();

        let mut atomic = Atomic::load(&path).unwrap();
        assert_eq!(atomic.encoder, vec!["base64"]);
        atomic.generate_abilities_and_vars();

        assert_eq!(atomic.abilities.len(), 1);
        // The record's own command is not normalized
        assert_eq!(atomic.abilities[0].decode_command().unwrap(), r"dir C:\\Users");
        assert_eq!(atomic.vars.len(), 1);
        assert_eq!(atomic.vars[0].decode_value().unwrap(), r"C:\Users\Public");
    }

    #[test]
    fn test_art_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("art.yaml");
        std::fs::write(&path, "art_path: /opt/atomic-red-team\ncti_path: /opt/cti\n").unwrap();

        let paths = ArtPaths::load(&path).unwrap();
        assert_eq!(paths.cti_path, PathBuf::from("/opt/cti"));
        assert_eq!(
            paths.technique_dir("T1003"),
            PathBuf::from("/opt/atomic-red-team/atomics/T1003")
        );
    }
}
