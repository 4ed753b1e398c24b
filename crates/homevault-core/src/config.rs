//! Configuration module for HomeVault.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for HomeVault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Reconciliation and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between auto-sync ticks for clients without their own interval.
    pub default_interval_secs: u64,
    /// Maximum attempts for a transient provider failure within one pass.
    pub max_retries: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_base_delay_ms: u64,
    /// Tokens expiring within this window are refreshed before a pass.
    pub token_refresh_margin_secs: u64,
}

/// Local persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding files, folders, clients and sync state.
    pub database_path: PathBuf,
    /// Directory under which file content blobs are stored.
    pub blob_root: PathBuf,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/homevault/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("homevault")
            .join("config.yaml")
    }
}

impl SyncConfig {
    /// Interval used when a client does not configure its own.
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 300,
            max_retries: 3,
            retry_base_delay_ms: 500,
            token_refresh_margin_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("homevault");
        Self {
            database_path: data_dir.join("homevault.db"),
            blob_root: data_dir.join("blobs"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.default_interval_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: String| {
            if !ok {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message,
                });
            }
        };

        check(
            self.sync.default_interval_secs > 0,
            "sync.default_interval_secs",
            "must be greater than 0".into(),
        );
        check(
            self.sync.max_retries <= 10,
            "sync.max_retries",
            "must be in range 0..=10".into(),
        );

        for (field, path) in [
            ("storage.database_path", &self.storage.database_path),
            ("storage.blob_root", &self.storage.blob_root),
        ] {
            check(!path.as_os_str().is_empty(), field, "must not be empty".into());
        }

        check(
            VALID_LOG_LEVELS.contains(&self.logging.level.as_str()),
            "logging.level",
            format!(
                "invalid level '{}'; valid options: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ),
        );
        check(
            VALID_LOG_FORMATS.contains(&self.logging.format.as_str()),
            "logging.format",
            format!(
                "invalid format '{}'; valid options: {}",
                self.logging.format,
                VALID_LOG_FORMATS.join(", ")
            ),
        );

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use homevault_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .sync_default_interval_secs(60)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_default_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.default_interval_secs = seconds;
        self
    }

    pub fn sync_max_retries(mut self, n: u32) -> Self {
        self.config.sync.max_retries = n;
        self
    }

    pub fn sync_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.retry_base_delay_ms = ms;
        self
    }

    pub fn sync_token_refresh_margin_secs(mut self, seconds: u64) -> Self {
        self.config.sync.token_refresh_margin_secs = seconds;
        self
    }

    // --- storage ---

    pub fn storage_database_path(mut self, path: PathBuf) -> Self {
        self.config.storage.database_path = path;
        self
    }

    pub fn storage_blob_root(mut self, path: PathBuf) -> Self {
        self.config.storage.blob_root = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.default_interval_secs, 300);
        assert_eq!(cfg.sync.default_interval(), Duration::from_secs(300));
        assert_eq!(cfg.sync.max_retries, 3);
        assert_eq!(cfg.sync.retry_base_delay(), Duration::from_millis(500));
        assert!(cfg
            .storage
            .database_path
            .to_string_lossy()
            .ends_with("homevault.db"));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "pretty");
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
sync:
  default_interval_secs: 60
  max_retries: 1
  retry_base_delay_ms: 10
storage:
  database_path: /tmp/hv/state.db
  blob_root: /tmp/hv/blobs
logging:
  level: debug
  format: json
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.default_interval_secs, 60);
        assert_eq!(cfg.sync.max_retries, 1);
        assert_eq!(cfg.sync.retry_base_delay_ms, 10);
        // Omitted keys keep their defaults.
        assert_eq!(cfg.sync.token_refresh_margin_secs, 60);
        assert_eq!(cfg.storage.database_path, PathBuf::from("/tmp/hv/state.db"));
        assert_eq!(cfg.storage.blob_root, PathBuf::from("/tmp/hv/blobs"));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"logging:\n  level: warn\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.logging.format, "pretty");
        assert_eq!(cfg.sync.default_interval_secs, 300);
    }

    #[test]
    fn load_or_default_falls_back_for_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/homevault/config.yaml"));
        assert_eq!(cfg.sync.default_interval_secs, 300);
    }

    #[test]
    fn validate_reports_every_problem() {
        let cfg = ConfigBuilder::new()
            .sync_default_interval_secs(0)
            .sync_max_retries(50)
            .logging_level("loud")
            .logging_format("xml")
            .build();

        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "sync.default_interval_secs",
                "sync.max_retries",
                "logging.level",
                "logging.format",
            ]
        );
    }

    #[test]
    fn builder_build_validated() {
        let ok = ConfigBuilder::new().sync_default_interval_secs(30).build_validated();
        assert!(ok.is_ok());

        let err = ConfigBuilder::new().logging_level("nope").build_validated();
        let errors = err.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string().split(':').next(), Some("logging.level"));
    }

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("homevault/config.yaml"));
    }
}
