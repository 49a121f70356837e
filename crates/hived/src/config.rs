//! Supervisor configuration.
//!
//! Loaded from TOML. Every field has a default, so a missing file or a
//! partial file is fine:
//!
//! ```toml
//! target_executable = "eqgame.exe"
//! module_path = 'C:\hive\hive.dll'
//! inject_delay_ms = 2000
//!
//! [retry]
//! attempts = 3
//! interval_ms = 1000
//!
//! [[hotkeys]]
//! chord = "ctrl+shift+u"
//! action = "unload_all"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use hive_core::KeyChord;
use hive_inject::InjectorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::hotkeys::GlobalAction;
use crate::registry::DEFAULT_PENDING_TIMEOUT;
use crate::server::DEFAULT_CHANNEL_PATH;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "HIVE_CONFIG";

/// Environment variable for the channel path.
///
/// Read by the command line, where it sits between `--channel` and the
/// config file.
pub const CHANNEL_ENV: &str = "HIVE_CHANNEL";

/// Module file looked up next to the supervisor binary when no path is set.
pub const DEFAULT_MODULE_NAME: &str = "hive.dll";

/// Errors raised while loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {reason}")]
    ReadFailed { path: PathBuf, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("No module path configured and the supervisor location is unknown")]
    NoModulePath,
}

/// AccessDenied retry policy for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A global hotkey from the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotkeyConfig {
    pub chord: KeyChord,
    pub action: GlobalAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable file name of the target game client
    pub target_executable: String,
    /// Extension module; defaults to [`DEFAULT_MODULE_NAME`] beside the binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_path: Option<PathBuf>,
    pub loader_module: String,
    pub loader_symbol: String,
    pub inject_timeout_ms: u64,
    /// Wait before injecting a freshly discovered process
    pub inject_delay_ms: u64,
    pub retry: RetryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_path: Option<PathBuf>,
    pub scan_interval_secs: u64,
    pub auto_inject: bool,
    pub pending_timeout_secs: u64,
    pub hotkeys: Vec<HotkeyConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let unload_all = KeyChord::new(
            hive_core::Modifiers {
                ctrl: true,
                shift: true,
                ..hive_core::Modifiers::NONE
            },
            "u",
        );
        Self {
            target_executable: "eqgame.exe".to_string(),
            module_path: None,
            loader_module: hive_inject::injector::DEFAULT_LOADER_MODULE.to_string(),
            loader_symbol: hive_inject::injector::DEFAULT_LOADER_SYMBOL.to_string(),
            inject_timeout_ms: 5000,
            inject_delay_ms: 0,
            retry: RetryConfig::default(),
            channel_path: None,
            scan_interval_secs: 2,
            auto_inject: true,
            pending_timeout_secs: DEFAULT_PENDING_TIMEOUT.as_secs(),
            hotkeys: unload_all
                .map(|chord| HotkeyConfig {
                    chord,
                    action: GlobalAction::UnloadAll,
                })
                .into_iter()
                .collect(),
        }
    }
}

impl SupervisorConfig {
    /// `$HIVE_CONFIG`, else `<config dir>/hive/hive.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("hive").join("hive.toml"))
    }

    /// Loads `path`, or the default path when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => {
                debug!("No config directory, using defaults");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseFailed { reason, .. } => ConfigError::ParseFailed {
                path: path.clone(),
                reason,
            },
            other => other,
        })?;

        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseFailed {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_executable.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "target_executable",
                reason: "must not be empty".to_string(),
            });
        }
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "scan_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.inject_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "inject_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// The configured path, else the platform default.
    pub fn channel_path(&self) -> PathBuf {
        self.channel_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHANNEL_PATH))
    }

    /// The module to inject.
    pub fn module_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.module_path {
            return Ok(path.clone());
        }
        std::env::current_exe()
            .ok()
            .map(|exe| exe.with_file_name(DEFAULT_MODULE_NAME))
            .ok_or(ConfigError::NoModulePath)
    }

    pub fn injector_config(&self) -> Result<InjectorConfig, ConfigError> {
        let mut config = InjectorConfig::new(self.module_path()?)
            .with_timeout(Duration::from_millis(self.inject_timeout_ms));
        config.loader_module = self.loader_module.clone();
        config.loader_symbol = self.loader_symbol.clone();
        Ok(config)
    }

    /// File name of the module, used to classify already-injected processes.
    pub fn module_file_name(&self) -> Result<String, ConfigError> {
        self.injector_config()?
            .module_file_name()
            .ok_or(ConfigError::Invalid {
                field: "module_path",
                reason: "has no file name".to_string(),
            })
    }

    pub fn inject_delay(&self) -> Duration {
        Duration::from_millis(self.inject_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.target_executable, "eqgame.exe");
        assert_eq!(config.loader_symbol, "LoadLibraryW");
        assert_eq!(config.retry, RetryConfig { attempts: 3, interval_ms: 1000 });
        assert!(config.auto_inject);
        assert_eq!(config.hotkeys.len(), 1);
        assert_eq!(
            config.hotkeys.first().map(|h| h.chord.to_string()).as_deref(),
            Some("ctrl+shift+u")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SupervisorConfig::from_toml(
            r#"
            module_path = "/opt/hive/hive.dll"
            inject_delay_ms = 1500

            [retry]
            attempts = 5

            [[hotkeys]]
            chord = "Alt+F12"
            action = "toggle_overlay"
            "#,
        )
        .unwrap();

        assert_eq!(config.inject_delay(), Duration::from_millis(1500));
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.interval_ms, 1000);
        assert_eq!(config.scan_interval_secs, 2);
        assert_eq!(
            config.hotkeys,
            vec![HotkeyConfig {
                chord: "alt+f12".parse().unwrap(),
                action: GlobalAction::Named("toggle_overlay".to_string()),
            }]
        );
        assert_eq!(config.module_file_name().unwrap(), "hive.dll");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SupervisorConfig::from_toml("scan_interval_secs = 0"),
            Err(ConfigError::Invalid {
                field: "scan_interval_secs",
                ..
            })
        ));
        assert!(matches!(
            SupervisorConfig::from_toml("[[hotkeys]]\nchord = \"ctrl+\"\naction = \"unload_all\""),
            Err(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn test_load_file_and_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hive.toml");

        let missing = SupervisorConfig::load(Some(&path)).unwrap();
        assert_eq!(missing, SupervisorConfig::default());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "target_executable = \"testgame.exe\"").unwrap();
        writeln!(file, "auto_inject = false").unwrap();
        drop(file);

        let loaded = SupervisorConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.target_executable, "testgame.exe");
        assert!(!loaded.auto_inject);
    }

    #[test]
    fn test_channel_path_prefers_configured_value() {
        // Overrides happen on the command line; the config never reads them.
        std::env::set_var(CHANNEL_ENV, "/tmp/from-env.sock");

        let mut config = SupervisorConfig::default();
        assert_eq!(config.channel_path(), PathBuf::from(DEFAULT_CHANNEL_PATH));

        config.channel_path = Some(PathBuf::from("/tmp/from-cli.sock"));
        assert_eq!(config.channel_path(), PathBuf::from("/tmp/from-cli.sock"));

        std::env::remove_var(CHANNEL_ENV);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(&path, "auto_inject = \"sometimes\"").unwrap();

        let err = SupervisorConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("hive.toml"));
    }
}
