//! Configuration loading, validation, and management for Ravel.
//!
//! Loads configuration from `~/.ravel/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.ravel/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step budget per context unless the context sets its own.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Timeout applied to calls whose definition sets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,

    /// Delay between retry attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Retries granted by `RetryPolicy::Enabled`.
    #[serde(default = "default_retry_attempts")]
    pub default_retry_attempts: u32,

    /// Buffer size of the run event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_steps() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    256
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            call_timeout_secs: None,
            retry_backoff_ms: default_retry_backoff_ms(),
            default_retry_attempts: default_retry_attempts(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Stream parser settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Tags recognized in addition to the built-in set.
    #[serde(default)]
    pub extra_tags: Vec<String>,

    /// Tags whose nested same-name opens are folded.
    #[serde(default = "default_dedup_tags")]
    pub dedup_tags: Vec<String>,
}

fn default_dedup_tags() -> Vec<String> {
    ["think", "thinking", "reasoning", "response"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            extra_tags: Vec::new(),
            dedup_tags: default_dedup_tags(),
        }
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory", "file", or "none"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Root directory for the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "memory".into()
}

const STORE_BACKENDS: &[&str] = &["memory", "file", "none"];

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

/// Logging settings, consumed by the CLI's tracing subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. "info" or "ravel_agent=debug".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the default path (~/.ravel/config.toml).
    ///
    /// Environment variables override the file:
    /// - `RAVEL_MAX_STEPS`
    /// - `RAVEL_STORE`
    /// - `RAVEL_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(steps) = lookup("RAVEL_MAX_STEPS") {
            self.engine.max_steps = steps.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("RAVEL_MAX_STEPS is not a number: {steps}"))
            })?;
        }

        if let Some(backend) = lookup("RAVEL_STORE") {
            self.store.backend = backend;
        }

        if let Some(level) = lookup("RAVEL_LOG") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ravel")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_steps must be at least 1".into(),
            ));
        }

        if self.engine.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_capacity must be at least 1".into(),
            ));
        }

        if self.engine.call_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "engine.call_timeout_secs must be > 0 when set".into(),
            ));
        }

        if !STORE_BACKENDS.contains(&self.store.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "store.backend must be one of {}, got '{}'",
                STORE_BACKENDS.join(", "),
                self.store.backend
            )));
        }

        if let Some(tag) = self
            .parser
            .extra_tags
            .iter()
            .find(|t| t.is_empty() || !t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(ConfigError::ValidationError(format!(
                "parser.extra_tags contains an invalid tag name: '{tag}'"
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `ravel config`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert_eq!(config.engine.max_steps, 5);
        assert_eq!(config.engine.retry_backoff_ms, 200);
        assert_eq!(config.store.backend, "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = RuntimeConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: RuntimeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[engine]\nmax_steps = 9\ncall_timeout_secs = 30\n\n[parser]\nextra_tags = [\"plan\"]").unwrap();

        let config = RuntimeConfig::load_from(tmp.path()).unwrap();
        assert_eq!(config.engine.max_steps, 9);
        assert_eq!(config.engine.call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.engine.default_retry_attempts, 3);
        assert_eq!(config.parser.extra_tags, vec!["plan"]);
        assert_eq!(config.parser.dedup_tags.len(), 4);
    }

    #[test]
    fn invalid_values_rejected() {
        let zero_steps = RuntimeConfig {
            engine: EngineConfig {
                max_steps: 0,
                ..EngineConfig::default()
            },
            ..RuntimeConfig::default()
        };
        assert!(zero_steps.validate().is_err());

        let bad_backend = RuntimeConfig {
            store: StoreConfig {
                backend: "redis".into(),
                path: None,
            },
            ..RuntimeConfig::default()
        };
        assert!(bad_backend.validate().is_err());

        let bad_tag = RuntimeConfig {
            parser: ParserConfig {
                extra_tags: vec!["has space".into()],
                ..ParserConfig::default()
            },
            ..RuntimeConfig::default()
        };
        assert!(bad_tag.validate().is_err());
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[engine\nmax_steps = ").unwrap();
        let err = RuntimeConfig::load_from(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = RuntimeConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert_eq!(result.unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RAVEL_MAX_STEPS", "12"),
            ("RAVEL_STORE", "file"),
            ("RAVEL_LOG", "debug"),
        ]);
        let mut config = RuntimeConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.engine.max_steps, 12);
        assert_eq!(config.store.backend, "file");
        assert_eq!(config.logging.level, "debug");

        let mut config = RuntimeConfig::default();
        let err = config.apply_env(|key| (key == "RAVEL_MAX_STEPS").then(|| "many".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = RuntimeConfig::default_toml();
        assert!(toml_str.contains("max_steps = 5"));
        assert!(toml_str.contains("backend = \"memory\""));
    }
}
