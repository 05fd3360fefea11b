//! Session configuration.
//!
//! Handles loading, validating, and merging `imgbridge.toml`. Stock defaults
//! are serialized to a TOML table and the user file is merged on top of it,
//! so a config file only needs the keys it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [cache]
//! max_operations = 100      # Operations kept in the operation cache
//! max_mem = 52428800        # Tracked memory before the cache is trimmed (50 MiB)
//! max_files = 20            # Open tracked files before the cache is trimmed
//!
//! [session]
//! auto_delete = false       # Queue every new handle for deletion on creation
//! concurrency = 4           # Pixel worker threads (omit for auto = CPU cores)
//!
//! [io]
//! source_buffer_size = 4096 # Bytes requested per source read
//! target_buffer_size = 8500 # Bytes buffered before a target write
//!
//! [security]
//! blocked_operations = []   # e.g. ["load_tiff", "gaussblur"]
//! max_image_pixels = 268435456  # Largest image an operation may create
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Name of the config file looked up by [`load_config`].
pub const CONFIG_FILENAME: &str = "imgbridge.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Session configuration loaded from `imgbridge.toml`.
///
/// All fields have defaults matching the limits the engine ships with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Operation cache limits.
    pub cache: CacheConfig,
    /// Handle and worker settings.
    pub session: SessionConfig,
    /// Connection buffering.
    pub io: IoConfig,
    /// Operation block list.
    pub security: SecurityConfig,
}

impl BridgeConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io.source_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "io.source_buffer_size must be non-zero".into(),
            ));
        }
        if self.io.target_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "io.target_buffer_size must be non-zero".into(),
            ));
        }
        if self.security.max_image_pixels == 0 {
            return Err(ConfigError::Validation(
                "security.max_image_pixels must be non-zero".into(),
            ));
        }
        if self.session.concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "session.concurrency must be at least 1".into(),
            ));
        }
        if let Some(name) = self
            .security
            .blocked_operations
            .iter()
            .find(|n| n.trim().is_empty())
        {
            return Err(ConfigError::Validation(format!(
                "security.blocked_operations contains an empty name ({name:?})"
            )));
        }
        Ok(())
    }
}

/// Operation cache limits.
///
/// Exceeding any of the three triggers eviction of the least recently used
/// cache entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_operations: usize,
    pub max_mem: u64,
    pub max_files: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_operations: 100,
            max_mem: 50 * 1024 * 1024,
            max_files: 20,
        }
    }
}

/// Handle and worker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Append every newly created handle to the deletion queue.
    pub auto_delete: bool,
    /// Worker threads for pixel evaluation.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub concurrency: Option<usize>,
}

/// Size of the session's worker pool: the configured concurrency capped at
/// the machine's core count, or every core when unset.
pub fn effective_threads(config: &SessionConfig) -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    match config.concurrency {
        Some(n) => n.min(cores),
        None => cores,
    }
}

/// Connection buffering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    pub source_buffer_size: usize,
    pub target_buffer_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            source_buffer_size: 4096,
            target_buffer_size: 8500,
        }
    }
}

/// Limits on what host input can make the engine do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Operations that fail with [`EngineError::Blocked`](crate::engine::EngineError::Blocked).
    pub blocked_operations: Vec<String>,
    /// Pixel count above which constructors and resizes are refused.
    pub max_image_pixels: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            blocked_operations: Vec::new(),
            max_image_pixels: 1 << 28,
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

/// [`BridgeConfig::default`] as a TOML table, the layer a config file is
/// merged onto.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(BridgeConfig::default())?)
}

/// Overlay `file` onto `defaults`. Sections merge key by key; any other
/// value in `file`, arrays included, replaces the default outright.
pub fn merge_toml(defaults: toml::Value, file: toml::Value) -> toml::Value {
    match (defaults, file) {
        (toml::Value::Table(mut table), toml::Value::Table(overrides)) => {
            for (key, value) in overrides {
                let merged = match table.remove(&key) {
                    Some(default) => merge_toml(default, value),
                    None => value,
                };
                table.insert(key, merged);
            }
            toml::Value::Table(table)
        }
        (_, file) => file,
    }
}

/// Session config for `dir`: stock defaults, overlaid with
/// `dir/imgbridge.toml` when that file exists, then validated.
pub fn load_config(dir: &Path) -> Result<BridgeConfig, ConfigError> {
    let path = dir.join(CONFIG_FILENAME);
    let mut value = stock_defaults_value()?;
    if path.is_file() {
        let file: toml::Value = toml::from_str(&fs::read_to_string(&path)?)?;
        value = merge_toml(value, file);
        tracing::debug!("Loaded {}", path.display());
    }
    let config: BridgeConfig = value.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Returns a fully-commented stock `imgbridge.toml`.
pub fn stock_config_toml() -> &'static str {
    r##"# imgbridge configuration
# =======================
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Operation cache
# ---------------------------------------------------------------------------
[cache]
# Number of operation results kept alive by the cache.
max_operations = 100

# Tracked memory (decoded pixels, memory connections) before the cache
# starts dropping entries, in bytes.
max_mem = 52428800

# Open tracked files before the cache starts dropping entries.
max_files = 20

# ---------------------------------------------------------------------------
# Session
# ---------------------------------------------------------------------------
[session]
# Queue every newly created handle for deletion. Flush the queue at safe
# points with Session::flush_deletion_queue.
auto_delete = false

# Worker threads for pixel evaluation.
# Omit or comment out to auto-detect (= number of CPU cores).
# concurrency = 4

# ---------------------------------------------------------------------------
# Connection buffering
# ---------------------------------------------------------------------------
[io]
# Bytes requested from a source per read.
source_buffer_size = 4096

# Bytes buffered before they are handed to a target.
target_buffer_size = 8500

# ---------------------------------------------------------------------------
# Security
# ---------------------------------------------------------------------------
[security]
# Operations refused by the engine, e.g. ["load_tiff", "gaussblur"].
blocked_operations = []

# Largest image, in pixels, that a constructor or resize may produce.
max_image_pixels = 268435456
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_cache_limits() {
        let config = BridgeConfig::default();
        assert_eq!(config.cache.max_operations, 100);
        assert_eq!(config.cache.max_mem, 50 * 1024 * 1024);
        assert_eq!(config.cache.max_files, 20);
    }

    #[test]
    fn default_config_has_io_buffers() {
        let config = BridgeConfig::default();
        assert_eq!(config.io.source_buffer_size, 4096);
        assert_eq!(config.io.target_buffer_size, 8500);
        assert!(!config.session.auto_delete);
        assert!(config.session.concurrency.is_none());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[cache]
max_files = 5
"#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.max_files, 5);
        // Default values preserved
        assert_eq!(config.cache.max_operations, 100);
        assert_eq!(config.io.target_buffer_size, 8500);
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILENAME),
            r#"
[session]
auto_delete = true
concurrency = 2

[security]
blocked_operations = ["load_tiff"]
"#,
        )
        .unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert!(config.session.auto_delete);
        assert_eq!(config.session.concurrency, Some(2));
        assert_eq!(config.security.blocked_operations, vec!["load_tiff"]);
        // Unspecified values should be defaults
        assert_eq!(config.cache.max_operations, 100);
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILENAME), "this is not valid toml [[[").unwrap();

        let result = load_config(tmp.path());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILENAME),
            r#"
[io]
source_buffer_size = 0
"#,
        )
        .unwrap();

        let result = load_config(tmp.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // effective_threads tests
    // =========================================================================

    #[test]
    fn effective_threads_auto() {
        let config = SessionConfig::default();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_threads(&config), cores);
    }

    #[test]
    fn effective_threads_clamped_to_cores() {
        let config = SessionConfig {
            concurrency: Some(100_000),
            ..Default::default()
        };
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_threads(&config), cores);
    }

    #[test]
    fn effective_threads_user_constrains_down() {
        let config = SessionConfig {
            concurrency: Some(1),
            ..Default::default()
        };
        assert_eq!(effective_threads(&config), 1);
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_toml_table_merge() {
        let base: toml::Value = toml::from_str(
            r#"
[cache]
max_operations = 100
max_files = 20
"#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
[cache]
max_files = 3
"#,
        )
        .unwrap();
        let merged = merge_toml(base, overlay);
        let cache = merged.get("cache").unwrap();
        assert_eq!(cache.get("max_files").unwrap().as_integer(), Some(3));
        assert_eq!(cache.get("max_operations").unwrap().as_integer(), Some(100));
    }

    #[test]
    fn merge_toml_array_replaced_not_appended() {
        let base: toml::Value = toml::from_str(
            r#"
[security]
blocked_operations = ["a", "b"]
"#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
[security]
blocked_operations = ["c"]
"#,
        )
        .unwrap();
        let merged = merge_toml(base, overlay);
        let ops = merged
            .get("security")
            .unwrap()
            .get("blocked_operations")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(ops.len(), 1);
    }

    // =========================================================================
    // Unknown key rejection tests
    // =========================================================================

    #[test]
    fn unknown_key_rejected() {
        let toml_str = r#"
[cache]
max_ops = 90
"#;
        let result: Result<BridgeConfig, _> = toml::from_str(toml_str);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn unknown_section_rejected() {
        let toml_str = r#"
[cahce]
max_operations = 90
"#;
        let result: Result<BridgeConfig, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn validate_default_config_passes() {
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_zero_concurrency() {
        let mut config = BridgeConfig::default();
        config.session.concurrency = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn validate_empty_blocked_name() {
        let mut config = BridgeConfig::default();
        config.security.blocked_operations = vec!["  ".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_zero_target_buffer() {
        let mut config = BridgeConfig::default();
        config.io.target_buffer_size = 0;
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Layering and stock file tests
    // =========================================================================

    #[test]
    fn file_overrides_one_key_of_a_section() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILENAME), "[cache]\nmax_mem = 1024\n").unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.cache.max_mem, 1024);
        assert_eq!(config.cache.max_files, 20);
        assert_eq!(config.security.max_image_pixels, 1 << 28);
    }

    #[test]
    fn validate_zero_pixel_budget() {
        let mut config = BridgeConfig::default();
        config.security.max_image_pixels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: BridgeConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn stock_config_toml_contains_all_sections() {
        let content = stock_config_toml();
        for section in ["[cache]", "[session]", "[io]", "[security]"] {
            assert!(content.contains(section), "missing {section}");
        }
    }

    #[test]
    fn stock_defaults_value_has_all_sections() {
        let val = stock_defaults_value().unwrap();
        assert!(val.is_table());
        for key in ["cache", "session", "io", "security"] {
            assert!(val.get(key).is_some(), "missing {key}");
        }
    }
}
