//! Engine configuration loading with multi-layer merge

use crate::cleanup::CleanupPolicy;
use crate::step::EngineSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Attack-technique bridge settings
    #[serde(default)]
    pub art: ArtConfig,
}

/// Global default settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Shell used for `-c` invocations
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Timeout for non-interactive commands, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Ceiling for an interactive dialogue, in seconds
    #[serde(default = "default_expect_timeout")]
    pub expect_timeout: u64,

    /// Bound on a single prompt wait, in seconds
    pub prompt_timeout: Option<u64>,

    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_command_timeout() -> u64 {
    300
}

fn default_expect_timeout() -> u64 {
    60
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            command_timeout: default_command_timeout(),
            expect_timeout: default_expect_timeout(),
            prompt_timeout: None,
            cleanup_policy: CleanupPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArtConfig {
    /// Where converted procedures are written
    pub output_root: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/ttp-engine/config.toml
    /// 3. .ttp-engine/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".ttp-engine/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".ttp-engine/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/ttp-engine/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ttp-engine/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        if other.defaults.shell != default_shell() {
            self.defaults.shell = other.defaults.shell;
        }
        if other.defaults.command_timeout != default_command_timeout() {
            self.defaults.command_timeout = other.defaults.command_timeout;
        }
        if other.defaults.expect_timeout != default_expect_timeout() {
            self.defaults.expect_timeout = other.defaults.expect_timeout;
        }
        if other.defaults.prompt_timeout.is_some() {
            self.defaults.prompt_timeout = other.defaults.prompt_timeout;
        }
        if other.defaults.cleanup_policy != CleanupPolicy::default() {
            self.defaults.cleanup_policy = other.defaults.cleanup_policy;
        }
        if other.art.output_root.is_some() {
            self.art.output_root = other.art.output_root;
        }
    }

    /// Runtime settings derived from the defaults table
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            shell: self.defaults.shell.clone(),
            command_timeout: Duration::from_secs(self.defaults.command_timeout),
            expect_timeout: Duration::from_secs(self.defaults.expect_timeout),
            prompt_timeout: self.defaults.prompt_timeout.map(Duration::from_secs),
            cleanup_policy: self.defaults.cleanup_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = EngineConfig::default().settings();
        assert_eq!(settings.shell, "sh");
        assert_eq!(settings.command_timeout, Duration::from_secs(300));
        assert_eq!(settings.expect_timeout, Duration::from_secs(60));
        assert_eq!(settings.prompt_timeout, None);
        assert_eq!(settings.cleanup_policy, CleanupPolicy::Deferred);
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [defaults]
            shell = "bash"
            expect_timeout = 120
            prompt_timeout = 10
            cleanup_policy = "immediate"

            [art]
            output_root = "/opt/ttps/art"
        "#
        )
        .unwrap();

        let config = EngineConfig::load_file(&config_path).unwrap();
        assert_eq!(config.defaults.shell, "bash");
        assert_eq!(config.defaults.expect_timeout, 120);
        assert_eq!(config.defaults.prompt_timeout, Some(10));
        assert_eq!(config.defaults.cleanup_policy, CleanupPolicy::Immediate);
        assert_eq!(config.art.output_root, Some(PathBuf::from("/opt/ttps/art")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "[defaults]\nshel = \"bash\"\n").unwrap();
        assert!(EngineConfig::load_file(&config_path).is_err());
    }

    #[test]
    fn test_config_merge() {
        let mut base = EngineConfig::default();
        base.defaults.command_timeout = 30;
        base.defaults.prompt_timeout = Some(5);

        let mut override_config = EngineConfig::default();
        override_config.defaults.shell = "bash".into();
        override_config.defaults.cleanup_policy = CleanupPolicy::Immediate;

        base.merge(override_config);

        assert_eq!(base.defaults.shell, "bash");
        assert_eq!(base.defaults.cleanup_policy, CleanupPolicy::Immediate);
        // Untouched keys keep earlier layers
        assert_eq!(base.defaults.command_timeout, 30);
        assert_eq!(base.defaults.prompt_timeout, Some(5));
    }

    #[test]
    fn test_project_layer() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".ttp-engine")).unwrap();
        std::fs::write(
            dir.path().join(".ttp-engine/config.toml"),
            "[defaults]\ncommand_timeout = 42\n",
        )
        .unwrap();

        let config = EngineConfig::load(Some(dir.path())).unwrap();
        assert_eq!(config.defaults.command_timeout, 42);
    }
}
