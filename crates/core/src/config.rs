//! Preview configuration
//!
//! Commands, time budgets and diagnostics settings for the preview lifecycle.
//! Every field has a default, so an empty configuration file is valid. Files
//! are JSON5 (`stagehand.json`, `stagehand.jsonc`) or TOML (`stagehand.toml`).

use crate::errors::{ConfigError, Result, StagehandError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Configuration file names searched for, in order
pub const CONFIG_FILE_NAMES: &[&str] = &["stagehand.json", "stagehand.jsonc", "stagehand.toml"];

/// A program plus its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Settings for one preview controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewConfig {
    /// Dependency install command
    pub install_command: CommandSpec,
    /// Long-running dev server command
    pub start_command: CommandSpec,
    /// Wall-clock budget for the install command
    pub install_timeout_secs: u64,
    /// Budget between spawning the server and its readiness notification
    pub start_timeout_secs: u64,
    /// Manifest required at the project root
    pub manifest_name: String,
    /// Bytes of process output retained for display
    pub excerpt_limit: usize,
    /// Pattern flagging suspicious server output (advisory only)
    pub error_pattern: String,
    /// Ports probed by runtimes that detect readiness themselves
    pub ready_ports: Vec<u16>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            install_command: CommandSpec::new("npm", ["install"]),
            start_command: CommandSpec::new("npm", ["run", "dev"]),
            install_timeout_secs: 180,
            start_timeout_secs: 120,
            manifest_name: crate::mount::MANIFEST_NAME.to_string(),
            excerpt_limit: 4096,
            error_pattern: "error|Error|EADDRINUSE".to_string(),
            ready_ports: vec![5173, 3000, 8080],
        }
    }
}

impl PreviewConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Compile the advisory error pattern
    pub fn error_regex(&self) -> std::result::Result<Regex, ConfigError> {
        Regex::new(&self.error_pattern).map_err(|e| ConfigError::Validation {
            message: format!("invalid errorPattern '{}': {}", self.error_pattern, e),
        })
    }

    /// Check the configuration for values the lifecycle cannot work with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (field, command) in [
            ("installCommand", &self.install_command),
            ("startCommand", &self.start_command),
        ] {
            if command.program.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: format!("{}.program must not be empty", field),
                });
            }
        }
        if self.install_timeout_secs == 0 || self.start_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "timeouts must be at least one second".to_string(),
            });
        }
        if self.manifest_name.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "manifestName must not be empty".to_string(),
            });
        }
        self.error_regex()?;
        Ok(())
    }
}

/// Loads [`PreviewConfig`] from disk
pub struct ConfigLoader;

impl ConfigLoader {
    /// Find the first configuration file in `dir`
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Load and validate a configuration file.
    ///
    /// `.toml` files are parsed as TOML, anything else as JSON5.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load_from_path(path: &Path) -> Result<PreviewConfig> {
        debug!("Loading preview configuration from {}", path.display());

        if !path.exists() {
            return Err(StagehandError::Config(ConfigError::NotFound {
                path: path.display().to_string(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            debug!("Failed to read configuration file: {}", e);
            StagehandError::Config(ConfigError::Io(e))
        })?;

        let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
        let config = if is_toml {
            Self::parse_toml(&content)?
        } else {
            Self::parse_json5(&content)?
        };

        config.validate()?;
        debug!(
            "Loaded configuration: install='{}' start='{}'",
            config.install_command, config.start_command
        );
        Ok(config)
    }

    fn parse_json5(content: &str) -> std::result::Result<PreviewConfig, ConfigError> {
        let raw: serde_json::Value = json5::from_str(content).map_err(|e| ConfigError::Parsing {
            message: format!("JSON parsing error: {}", e),
        })?;

        if !raw.is_object() {
            return Err(ConfigError::Validation {
                message: "configuration must contain a JSON object literal".to_string(),
            });
        }

        serde_json::from_value(raw).map_err(|e| ConfigError::Validation {
            message: format!("Deserialization error: {}", e),
        })
    }

    fn parse_toml(content: &str) -> std::result::Result<PreviewConfig, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parsing {
            message: format!("TOML parsing error: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PreviewConfig::default();
        assert_eq!(config.install_command.to_string(), "npm install");
        assert_eq!(config.start_command.to_string(), "npm run dev");
        assert_eq!(config.install_timeout(), Duration::from_secs(180));
        assert_eq!(config.start_timeout(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
        assert!(config.error_regex().unwrap().is_match("EADDRINUSE: port taken"));
    }

    #[test]
    fn test_load_json5_with_partial_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.json");
        std::fs::write(
            &path,
            r#"{
                // pnpm instead of npm
                installCommand: { program: "pnpm", args: ["install"] },
                startTimeoutSecs: 30,
            }"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.install_command.program, "pnpm");
        assert_eq!(config.start_timeout_secs, 30);
        assert_eq!(config.install_timeout_secs, 180);
    }

    #[test]
    fn test_load_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(
            &path,
            "installTimeoutSecs = 60\nreadyPorts = [4000]\n\n[startCommand]\nprogram = \"yarn\"\nargs = [\"dev\"]\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.install_timeout_secs, 60);
        assert_eq!(config.ready_ports, vec![4000]);
        assert_eq!(config.start_command.to_string(), "yarn dev");
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::load_from_path(Path::new("/nonexistent/stagehand.json"))
            .unwrap_err();
        assert!(matches!(
            err,
            StagehandError::Config(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = PreviewConfig {
            install_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PreviewConfig {
            error_pattern: "(unclosed".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { .. })
        ));

        let config = PreviewConfig {
            start_command: CommandSpec::new("  ", Vec::<String>::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let err = ConfigLoader::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn test_discover() {
        let dir = TempDir::new().unwrap();
        assert!(ConfigLoader::discover(dir.path()).is_none());
        std::fs::write(dir.path().join("stagehand.toml"), "").unwrap();
        assert_eq!(
            ConfigLoader::discover(dir.path()),
            Some(dir.path().join("stagehand.toml"))
        );
    }
}
