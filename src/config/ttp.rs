//! Declarative procedure documents (YAML)

use super::LoadError;
use crate::step::{CommandStep, ExpectSpec, ExpectStep, Step, StepKind, StepMeta};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// An argument a procedure or step accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArgSpec {
    pub name: String,

    /// `string`, `int`, `bool` or `path`; free text is accepted
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub arg_type: Option<String>,

    #[serde(
        default,
        deserialize_with = "scalar_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ArgSpec {
    pub fn with_default(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
            ..Default::default()
        }
    }

    /// Reject values that cannot be read as the declared type
    fn check(&self, value: &str) -> Result<(), LoadError> {
        let ok = match self.arg_type.as_deref() {
            Some("int") => value.trim().parse::<i64>().is_ok(),
            Some("bool") => value.trim().parse::<bool>().is_ok(),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(LoadError::InvalidArgument {
                name: self.name.clone(),
                arg_type: self.arg_type.clone().unwrap_or_default(),
                value: value.to_string(),
            })
        }
    }
}

/// ATT&CK technique references
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MitreInfo {
    #[serde(default)]
    pub techniques: Vec<String>,
}

/// One entry of `steps:` as written
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_platforms: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<String>,

    /// Outer `Some` when the key is present, even as `expect: ~`
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub expect: Option<Option<ExpectSpec>>,
}

impl StepConfig {
    /// Pick the variant by which payload key is present
    pub fn into_step(self) -> Result<Step, LoadError> {
        let meta = StepMeta {
            name: self.name.clone(),
            description: self.description,
            supported_platforms: self.supported_platforms,
            args: self.args,
        };

        let kind = match (self.inline, self.expect) {
            (Some(inline), None) => StepKind::Command(CommandStep {
                inline,
                chdir: self.chdir,
                cleanup: self.cleanup,
            }),
            (None, Some(expect)) => {
                if self.cleanup.is_some() {
                    return Err(LoadError::MisplacedField {
                        step: self.name,
                        field: "cleanup",
                    });
                }
                if self.chdir.is_some() {
                    return Err(LoadError::MisplacedField {
                        step: self.name,
                        field: "chdir",
                    });
                }
                StepKind::Expect(ExpectStep { expect })
            }
            (Some(_), Some(_)) => return Err(LoadError::AmbiguousStep { step: self.name }),
            (None, None) => return Err(LoadError::MissingPayload { step: self.name }),
        };

        Ok(Step::new(meta, kind))
    }
}

/// A procedure document as written
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TtpConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitre: Option<MitreInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl TtpConfig {
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, LoadError> {
        serde_yaml::from_str(text).map_err(|e| LoadError::parse(path, e))
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Check structure and build runnable steps; `base_dir` anchors relative paths
    pub fn build(self, base_dir: PathBuf) -> Result<Ttp, LoadError> {
        if self.name.trim().is_empty() {
            return Err(LoadError::MissingName);
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.into_iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(LoadError::EmptyStepName { index: index + 1 });
            }
            if !seen.insert(step.name.clone()) {
                return Err(LoadError::DuplicateStep { name: step.name });
            }
            steps.push(step.into_step()?);
        }

        Ok(Ttp {
            name: self.name,
            description: self.description,
            args: self.args,
            env: self.env.into_iter().collect(),
            steps,
            workdir: base_dir,
        })
    }
}

/// A loaded, structurally valid procedure
#[derive(Debug, Clone)]
pub struct Ttp {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgSpec>,
    pub env: HashMap<String, String>,
    pub steps: Vec<Step>,
    /// Directory the procedure file lives in
    pub workdir: PathBuf,
}

impl Ttp {
    /// Read and build a procedure file
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        TtpConfig::from_yaml(&text, path)?.build(base_dir)
    }

    /// Resolve argument values: CLI over procedure defaults over step defaults.
    ///
    /// Returns procedure-level values plus any CLI values for step-scoped
    /// arguments. Step defaults are applied when the step renders.
    pub fn resolve_args(
        &self,
        cli: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, LoadError> {
        let step_specs: Vec<&ArgSpec> = self
            .steps
            .iter()
            .flat_map(|s| s.meta.args.iter())
            .collect();

        for name in cli.keys() {
            let declared = self.args.iter().any(|a| &a.name == name)
                || step_specs.iter().any(|a| &a.name == name);
            if !declared {
                return Err(LoadError::UnknownArgument { name: name.clone() });
            }
        }

        let mut resolved = HashMap::new();
        for spec in &self.args {
            let value = cli
                .get(&spec.name)
                .cloned()
                .or_else(|| spec.default.clone())
                .ok_or_else(|| LoadError::MissingArgument {
                    name: spec.name.clone(),
                })?;
            spec.check(&value)?;
            resolved.insert(spec.name.clone(), value);
        }

        for spec in step_specs {
            if let Some(value) = cli.get(&spec.name) {
                spec.check(value)?;
                resolved.insert(spec.name.clone(), value.clone());
            } else if !resolved.contains_key(&spec.name) && spec.default.is_none() {
                return Err(LoadError::MissingArgument {
                    name: spec.name.clone(),
                });
            }
        }

        Ok(resolved)
    }
}

/// Distinguish an absent key (`None`) from one written as null (`Some(None)`)
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Accept any YAML scalar (`30`, `true`, `"x"`) as its string form
fn scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "argument default must be a scalar, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Ttp, LoadError> {
        TtpConfig::from_yaml(yaml, Path::new("test.yaml"))?.build(PathBuf::from("/work"))
    }

    const SSH_TTP: &str = r#"
name: ssh-login
description: log in and check identity
args:
  - name: user
    default: bobbo
  - name: port
    type: int
    default: 22
steps:
  - name: connect
    expect:
      inline: ssh -p {{ args.port }} {{ args.user }}@k8s6
      responses:
        - prompt: "password:"
          response: "{{ args.password }}"
        - prompt: "\\$ "
          response: whoami
      cleanup: rm -f /tmp/ssh.marker
    args:
      - name: password
  - name: note
    inline: echo done
    cleanup: echo undo
"#;

    #[test]
    fn test_parse_mixed_steps() {
        let ttp = parse(SSH_TTP).unwrap();
        assert_eq!(ttp.name, "ssh-login");
        assert_eq!(ttp.steps.len(), 2);
        assert!(matches!(ttp.steps[0].kind, StepKind::Expect(_)));
        assert!(matches!(ttp.steps[1].kind, StepKind::Command(_)));

        let StepKind::Expect(expect) = &ttp.steps[0].kind else {
            unreachable!()
        };
        let spec = expect.expect.as_ref().unwrap();
        assert_eq!(spec.responses.len(), 2);
        assert_eq!(spec.responses[1].prompt, "\\$ ");
        assert_eq!(ttp.args[1].default.as_deref(), Some("22"));
    }

    #[test]
    fn test_null_expect_selects_expect_variant() {
        let ttp = parse("name: t\nsteps:\n  - name: s\n    expect:\n").unwrap();
        let StepKind::Expect(step) = &ttp.steps[0].kind else {
            panic!("expected the expect variant");
        };
        assert!(step.expect.is_none());
    }

    #[test]
    fn test_both_payloads_rejected() {
        let err = parse(
            "name: t\nsteps:\n  - name: s\n    inline: id\n    expect:\n      inline: id\n",
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::AmbiguousStep { .. }));
    }

    #[test]
    fn test_no_payload_rejected() {
        let err = parse("name: t\nsteps:\n  - name: s\n").unwrap_err();
        assert!(matches!(err, LoadError::MissingPayload { .. }));
    }

    #[test]
    fn test_duplicate_and_empty_names() {
        let err = parse("name: t\nsteps:\n  - name: a\n    inline: x\n  - name: a\n    inline: y\n")
            .unwrap_err();
        assert!(matches!(err, LoadError::DuplicateStep { .. }));

        let err = parse("name: t\nsteps:\n  - inline: x\n").unwrap_err();
        assert!(matches!(err, LoadError::EmptyStepName { index: 1 }));

        assert!(matches!(parse("steps: []\n").unwrap_err(), LoadError::MissingName));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse("name: t\nsteps:\n  - name: a\n    inlne: x\n").unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn test_resolve_args_precedence() {
        let ttp = parse(SSH_TTP).unwrap();

        let mut cli = HashMap::new();
        cli.insert("password".to_string(), "hunter2".to_string());
        cli.insert("user".to_string(), "alice".to_string());

        let args = ttp.resolve_args(&cli).unwrap();
        assert_eq!(args["user"], "alice");
        assert_eq!(args["port"], "22");
        assert_eq!(args["password"], "hunter2");
    }

    #[test]
    fn test_resolve_args_missing_and_unknown() {
        let ttp = parse(SSH_TTP).unwrap();
        let err = ttp.resolve_args(&HashMap::new()).unwrap_err();
        assert!(matches!(err, LoadError::MissingArgument { ref name } if name == "password"));

        let mut cli = HashMap::new();
        cli.insert("password".to_string(), "x".to_string());
        cli.insert("nope".to_string(), "x".to_string());
        assert!(matches!(
            ttp.resolve_args(&cli).unwrap_err(),
            LoadError::UnknownArgument { .. }
        ));
    }

    #[test]
    fn test_resolve_args_type_check() {
        let ttp = parse(SSH_TTP).unwrap();
        let mut cli = HashMap::new();
        cli.insert("password".to_string(), "x".to_string());
        cli.insert("port".to_string(), "twenty".to_string());
        assert!(matches!(
            ttp.resolve_args(&cli).unwrap_err(),
            LoadError::InvalidArgument { .. }
        ));
    }

    #[test]
    fn test_load_from_file_sets_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ttp.yaml");
        std::fs::write(&path, "name: t\nsteps:\n  - name: a\n    inline: id\n").unwrap();

        let ttp = Ttp::load(&path).unwrap();
        assert_eq!(ttp.workdir, dir.path());

        let missing = Ttp::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, LoadError::Io { .. }));
    }
}
