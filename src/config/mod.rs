//! Configuration management for QRScan
//!
//! This module handles loading, validating, and managing configuration
//! for the scanner, its history storage and verification mode.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Camera and decoder configuration
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// History storage configuration
    #[serde(default)]
    pub history: HistoryConfig,

    /// Verification mode configuration
    #[serde(default)]
    pub verification: VerificationConfig,
}

/// Camera and decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Frames submitted to the decoder per second
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Default device: "environment", "user", "default" or a device path
    #[serde(default = "default_device")]
    pub device: String,

    /// Directory holding video device nodes
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,

    /// Command that writes one frame from `{device}` to `{output}`
    #[serde(default = "default_capture_command")]
    pub capture_command: Vec<String>,

    /// Command that prints the QR payload found in `{image}`
    #[serde(default = "default_decode_command")]
    pub decode_command: Vec<String>,

    /// Copy every decoded payload to the clipboard
    #[serde(default)]
    pub copy_to_clipboard: bool,
}

/// Storage backend for the scan history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite database at `path`
    Sqlite,
    /// JSON files in the directory at `path`
    File,
    /// Nothing is written to disk
    Memory,
}

/// History storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Storage backend
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Database file (sqlite) or directory (file)
    #[serde(default = "default_history_path")]
    pub path: PathBuf,

    /// Key the history list is stored under
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

/// Verification mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Flag every recorded scan as a verification scan
    #[serde(default)]
    pub enabled: bool,

    /// Open decoded links automatically while verifying
    #[serde(default = "default_auto_open")]
    pub auto_open_urls: bool,

    /// Delay before opening a decoded link, in milliseconds
    #[serde(default = "default_redirect_delay_ms")]
    pub redirect_delay_ms: u64,
}

// Default value functions
fn default_fps() -> u32 {
    10
}

fn default_device() -> String {
    "environment".to_string()
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_capture_command() -> Vec<String> {
    [
        "ffmpeg", "-loglevel", "error", "-f", "v4l2", "-i", "{device}", "-frames:v", "1", "-y",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_decode_command() -> Vec<String> {
    ["zbarimg", "--quiet", "--raw", "-Sdisable", "-Sqrcode.enable", "{image}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_history_path() -> PathBuf {
    PathBuf::from("~/.local/share/qrscan/history.db")
}

fn default_storage_key() -> String {
    crate::history::HISTORY_STORAGE_KEY.to_string()
}

fn default_auto_open() -> bool {
    true
}

fn default_redirect_delay_ms() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            device: default_device(),
            device_dir: default_device_dir(),
            capture_command: default_capture_command(),
            decode_command: default_decode_command(),
            copy_to_clipboard: false,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_history_path(),
            storage_key: default_storage_key(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_open_urls: default_auto_open(),
            redirect_delay_ms: default_redirect_delay_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            history: HistoryConfig::default(),
            verification: VerificationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from QRSCAN_CONFIG environment variable
    /// 2. ~/.config/qrscan/config.toml
    /// 3. Falls back to defaults if none exists
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut config = Self::default();
                config.expand_paths();
                Ok(config)
            }
        }
    }

    /// Load from an explicit path, or the default locations
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("qrscan").join("config.toml"))
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("QRSCAN_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|p| p.exists())
    }

    /// Expand tilde in paths
    fn expand_paths(&mut self) {
        self.scanner.device_dir = expand_path(&self.scanner.device_dir);
        self.history.path = expand_path(&self.history.path);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=60).contains(&self.scanner.fps) {
            return Err(ConfigError::Validation(
                "scanner.fps must be between 1 and 60".to_string(),
            ));
        }

        if self.scanner.capture_command.is_empty() {
            return Err(ConfigError::Validation(
                "scanner.capture_command must not be empty".to_string(),
            ));
        }

        if self.scanner.decode_command.is_empty() {
            return Err(ConfigError::Validation(
                "scanner.decode_command must not be empty".to_string(),
            ));
        }

        if self.history.storage_key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "history.storage_key must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Write the configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write a commented example configuration to `path`
    pub fn write_example(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example()?)?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> Result<String, ConfigError> {
        let config = Config::default();
        let quoted = |args: &[String]| -> Result<String, ConfigError> {
            Ok(toml::Value::Array(
                args.iter().map(|a| toml::Value::String(a.clone())).collect(),
            )
            .to_string())
        };

        Ok(format!(
            r#"# QRScan Configuration File
# Location: ~/.config/qrscan/config.toml

# Logging level (trace, debug, info, warn, error)
log_level = "{}"

# Camera and decoder settings
[scanner]
# Frames submitted to the decoder per second (1-60)
fps = {}
# Default camera: "environment", "user", "default" or a device path
device = "{}"
# Directory containing videoN device nodes
device_dir = "{}"
# Writes one frame from {{device}} to {{output}}
capture_command = {}
# Prints the QR payload found in {{image}}; exit code 4 means no symbol
decode_command = {}
# Copy decoded payloads to the clipboard automatically
copy_to_clipboard = {}

# Scan history settings
[history]
# Storage backend: sqlite, file or memory
backend = "sqlite"
# Database file (sqlite) or directory (file)
path = "{}"
# Key the history list is stored under
storage_key = "{}"

# Certificate verification mode
[verification]
# Flag recorded scans as verification scans
enabled = {}
# Open decoded links automatically while verifying
auto_open_urls = {}
# Delay before opening a decoded link (milliseconds)
redirect_delay_ms = {}
"#,
            config.log_level,
            config.scanner.fps,
            config.scanner.device,
            config.scanner.device_dir.display(),
            quoted(&config.scanner.capture_command)?,
            quoted(&config.scanner.decode_command)?,
            config.scanner.copy_to_clipboard,
            config.history.path.display(),
            config.history.storage_key,
            config.verification.enabled,
            config.verification.auto_open_urls,
            config.verification.redirect_delay_ms,
        ))
    }
}

/// Expand tilde in path
fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(path_str.as_ref());
    PathBuf::from(expanded.into_owned())
}
