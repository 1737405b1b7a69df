//! Device configuration
//!
//! Loading, validation and serialization of the device runtime settings.

use crate::{is_valid_channel, MctError, Result, MAX_COMMAND_SIZE};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main device configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Control-link transport
    pub transport: TransportConfig,
    /// Radio and injection settings
    pub radio: RadioConfig,
    /// Activity timeouts and pacing
    pub timing: TimingConfig,
    /// Capture file storage
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Service name
    pub name: String,
    /// Name shown on the device display
    pub device_name: String,
    /// Interval between status display refreshes (ms)
    pub heartbeat_interval: u64,
}

/// Control-link transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to bind
    pub bind_address: String,
    /// UDP port
    pub port: u16,
    /// Largest single outbound message before list results are chunked
    pub max_message_size: usize,
    /// Receive buffer size
    pub recv_buffer_size: usize,
}

/// Radio configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Channel used when a command does not name one
    pub default_channel: u8,
    /// Depth of the capture record queue
    pub capture_queue_depth: usize,
    /// Transmissions per deauthentication burst
    pub deauth_burst: usize,
    /// Gap between burst transmissions (ms)
    pub deauth_gap_ms: u64,
}

/// Timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Scan completion deadline (ms)
    pub scan_timeout_ms: u64,
    /// Scan progress poll interval (ms)
    pub scan_poll_ms: u64,
    /// Chunk session inactivity timeout (ms)
    pub chunk_timeout_ms: u64,
    /// Pause between bursts of a timed deauthentication (ms)
    pub deauth_interval_ms: u64,
    /// Default pause between beacons (ms)
    pub beacon_interval_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Whether capture storage is attached
    pub enabled: bool,
    /// Directory capture files are written under
    pub root: PathBuf,
}

/// Accepted values of `logging.format`
pub const LOG_FORMATS: [&str; 2] = ["text", "compact"];

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

/// Configuration validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether configuration is valid
    pub valid: bool,
    /// Validation errors
    pub errors: Vec<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

/// Configuration manager
pub struct ConfigManager {
    /// Current configuration
    config: DaemonConfig,
    /// Path to configuration file
    config_path: Option<PathBuf>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &self.config)
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "mct-core".to_string(),
            device_name: "MCT2032".to_string(),
            heartbeat_interval: 5000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2032,
            max_message_size: MAX_COMMAND_SIZE,
            recv_buffer_size: 4096,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            default_channel: 1,
            capture_queue_depth: crate::monitor::CAPTURE_QUEUE_DEPTH,
            deauth_burst: crate::inject::DEAUTH_BURST,
            deauth_gap_ms: 1,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            scan_poll_ms: 100,
            chunk_timeout_ms: 10_000,
            deauth_interval_ms: 100,
            beacon_interval_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn scan_poll(&self) -> Duration {
        Duration::from_millis(self.scan_poll_ms.max(1))
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("./captures"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    /// Create new configuration manager
    pub fn new() -> Self {
        Self::with_config(DaemonConfig::default())
    }

    /// Create configuration manager with config
    pub fn with_config(config: DaemonConfig) -> Self {
        Self {
            config,
            config_path: None,
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| MctError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DaemonConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| MctError::Config(format!("Failed to parse JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| MctError::Config(format!("Failed to parse TOML config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| MctError::Config(format!("Failed to parse YAML config: {}", e)))?,
            _ => return Err(MctError::Config("Unsupported config file format".to_string())),
        };

        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => self.to_json()?,
            Some("toml") => self.to_toml()?,
            Some("yaml") | Some("yml") => self.to_yaml()?,
            _ => return Err(MctError::Config("Unsupported config file format".to_string())),
        };

        fs::write(path, content)
            .map_err(|e| MctError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Get current configuration
    pub fn get_config(&self) -> &DaemonConfig {
        &self.config
    }

    /// File the configuration was loaded from
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn into_config(self) -> DaemonConfig {
        self.config
    }

    /// Validate configuration
    pub fn validate_config(&self, config: &DaemonConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if config.general.name.is_empty() {
            result.errors.push("Service name cannot be empty".to_string());
        }

        if config.transport.port == 0 {
            result.errors.push("UDP port cannot be 0".to_string());
        }

        if config.transport.max_message_size < 64 {
            result
                .errors
                .push("Max message size must be at least 64 bytes".to_string());
        }

        if config.transport.recv_buffer_size < config.transport.max_message_size {
            result
                .warnings
                .push("Receive buffer is smaller than max message size".to_string());
        }

        if !is_valid_channel(config.radio.default_channel) {
            result.errors.push(format!(
                "Default channel {} is outside 1-14",
                config.radio.default_channel
            ));
        }

        if config.radio.capture_queue_depth == 0 {
            result
                .errors
                .push("Capture queue depth cannot be 0".to_string());
        }

        if config.radio.deauth_burst == 0 {
            result.warnings.push("Deauth burst is 0, using 1".to_string());
        }

        if config.timing.scan_timeout_ms == 0 {
            result.errors.push("Scan timeout cannot be 0".to_string());
        }

        if config.timing.chunk_timeout_ms == 0 {
            result.errors.push("Chunk timeout cannot be 0".to_string());
        }

        if config.timing.scan_poll_ms >= config.timing.scan_timeout_ms {
            result
                .warnings
                .push("Scan poll interval is not shorter than the scan timeout".to_string());
        }

        if config.storage.enabled && config.storage.root.as_os_str().is_empty() {
            result
                .errors
                .push("Storage root cannot be empty when storage is enabled".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            result.errors.push(format!(
                "Invalid log level '{}', must be one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ));
        }

        if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
            result.errors.push(format!(
                "Invalid log format '{}', must be one of: {}",
                config.logging.format,
                LOG_FORMATS.join(", ")
            ));
        }

        result.valid = result.errors.is_empty();

        Ok(result)
    }

    /// Get configuration as JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.config)
            .map_err(|e| MctError::Config(format!("Failed to serialize config to JSON: {}", e)))
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config)
            .map_err(|e| MctError::Config(format!("Failed to serialize config to TOML: {}", e)))
    }

    /// Get configuration as YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.config)
            .map_err(|e| MctError::Config(format!("Failed to serialize config to YAML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.general.name, "mct-core");
        assert_eq!(config.transport.max_message_size, 512);
        assert_eq!(config.timing.scan_timeout(), Duration::from_secs(10));
        assert_eq!(config.timing.chunk_timeout(), Duration::from_secs(10));
        assert_eq!(config.radio.deauth_burst, 5);
    }

    #[test]
    fn test_config_validation() {
        let manager = ConfigManager::new();
        let result = manager.validate_config(&DaemonConfig::default()).unwrap();
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_config_validation_errors() {
        let manager = ConfigManager::new();
        let mut config = DaemonConfig::default();
        config.radio.default_channel = 15;
        config.transport.port = 0;
        config.logging.level = "loud".to_string();
        config.logging.format = "xml".to_string();

        let result = manager.validate_config(&config).unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 4);
    }

    #[test]
    fn test_config_serialization() {
        let manager = ConfigManager::new();
        assert!(manager.to_json().unwrap().contains("mct-core"));
        assert!(manager.to_toml().unwrap().contains("mct-core"));
        assert!(manager.to_yaml().unwrap().contains("mct-core"));
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.transport.port = 4040;
        config.radio.default_channel = 11;
        let manager = ConfigManager::with_config(config.clone());

        for name in ["device.json", "device.toml", "device.yaml"] {
            let path = dir.path().join(name);
            manager.save_to_file(&path).unwrap();
            let loaded = ConfigManager::load_from_file(&path).unwrap();
            assert_eq!(loaded.get_config(), &config);
            assert_eq!(loaded.config_path(), Some(path.as_path()));
        }

        assert!(manager.save_to_file(dir.path().join("device.ini")).is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[transport]\nport = 9000\n").unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(manager.get_config().transport.port, 9000);
        assert_eq!(manager.get_config().transport.max_message_size, 512);
        assert_eq!(manager.get_config().general.name, "mct-core");
    }
}
