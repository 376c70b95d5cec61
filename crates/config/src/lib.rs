//! Configuration management for the stream analytics engine
//!
//! Engine settings are layered with figment: an optional YAML or JSON file,
//! then environment variables prefixed with `STREAM_ANALYTICS_` (nested keys
//! separated by `__`, e.g. `STREAM_ANALYTICS_SERVICE__BATCH_SIZE=500`).

use figment::{
    providers::{Env, Format, Json, Yaml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable prefix for engine overrides
pub const ENV_PREFIX: &str = "STREAM_ANALYTICS_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Service configuration
    pub service: ServiceConfig,

    /// Checkpoint storage
    pub checkpoint: CheckpointStorageConfig,

    /// Directory for backpressure spill segments (per stream subdirectory)
    pub spill_dir: Option<PathBuf>,

    /// Observability settings
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            figment = merge_file(figment, path);
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: EngineConfig = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "service.tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.service.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "service.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint.max_checkpoints == 0 {
            return Err(ConfigError::ValidationError(
                "checkpoint.max_checkpoints must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name used in logs
    pub name: String,

    /// Processing tick interval in milliseconds
    pub tick_interval_ms: u64,

    /// Capacity of the channel between the supervisor and the output dispatcher
    pub channel_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "stream-analytics".to_string(),
            tick_interval_ms: 100,
            channel_capacity: 1024,
        }
    }
}

/// Checkpoint storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointStorageConfig {
    /// Checkpoint directory; in-memory storage is used when unset
    pub dir: Option<PathBuf>,

    /// Number of checkpoints retained per stream
    pub max_checkpoints: usize,
}

impl Default for CheckpointStorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_checkpoints: 5,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,

    /// Enable structured JSON logging
    pub json_logging: bool,

    /// Collect prometheus metrics
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            metrics_enabled: true,
        }
    }
}

/// Load a serde document (e.g. a stream definition) from a YAML or JSON file
///
/// The format is chosen by extension; anything other than `.json` is read as YAML.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    merge_file(Figment::new(), path)
        .extract()
        .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))
}

/// Parse a serde document from a YAML string
pub fn parse_yaml_document<T: DeserializeOwned>(source: &str) -> Result<T> {
    Figment::new()
        .merge(Yaml::string(source))
        .extract()
        .map_err(|e| ConfigError::LoadError(e.to_string()))
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Yaml::file(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.service.tick_interval_ms, 100);
        assert!(config.checkpoint.dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.service.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        config.service.tick_interval_ms = 50;
        config.checkpoint.max_checkpoints = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "service:\n  tick_interval_ms: 25\ncheckpoint:\n  dir: /tmp/ckpt\n  max_checkpoints: 2"
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.service.tick_interval_ms, 25);
        assert_eq!(config.checkpoint.max_checkpoints, 2);
        assert_eq!(config.checkpoint.dir, Some(PathBuf::from("/tmp/ckpt")));
        assert_eq!(config.service.channel_capacity, 1024);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = EngineConfig::load(Some(Path::new("/nonexistent/engine.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[derive(Debug, Deserialize)]
    struct Doc {
        id: String,
        size: u64,
    }

    #[test]
    fn test_load_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, r#"{"id": "orders", "size": 60000}"#).unwrap();

        let doc: Doc = load_document(&path).unwrap();
        assert_eq!(doc.id, "orders");
        assert_eq!(doc.size, 60_000);
    }

    #[test]
    fn test_parse_yaml_document() {
        let doc: Doc = parse_yaml_document("id: clicks\nsize: 10").unwrap();
        assert_eq!(doc.id, "clicks");
        assert!(parse_yaml_document::<Doc>("id: clicks").is_err());
    }
}
