//! Application configuration.
//!
//! Collects the settings of every module into a single `Config` that can be
//! loaded from YAML files and environment variables.

use serde::Deserialize;

use crate::distribution::DistributionConfig;
use crate::logstream::flow_control::RequestLimitConfig;
use crate::logstream::LogStreamConfig;
use crate::snapshot::DEFAULT_CHUNK_SIZE;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TIDELOG_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TIDELOG";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TIDELOG_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "TIDELOG_LOG_FORMAT";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config value '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Partition layout.
    pub cluster: ClusterConfig,
    /// Log stream and flow control.
    pub log_stream: LogStreamConfig,
    /// Snapshot transfer.
    pub snapshot: SnapshotConfig,
    /// Command redistribution timing.
    pub distribution: DistributionConfig,
}

/// Partition layout of a cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of partitions, numbered from 1.
    pub partition_count: u32,
    /// How often partition runtimes wake up to run timers.
    pub tick_interval_ms: u64,
    /// Upper bound of rounds `LocalCluster::run_until_idle` runs.
    pub max_idle_rounds: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partition_count: 3,
            tick_interval_ms: 100,
            max_idle_rounds: 1_000,
        }
    }
}

/// Snapshot transfer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Maximum content bytes per chunk.
    pub chunk_size: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.partition_count == 0 {
            return Err(ConfigError::Invalid {
                field: "cluster.partition_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.snapshot.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "snapshot.chunk_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.log_stream.max_fragment_size == 0 {
            return Err(ConfigError::Invalid {
                field: "log_stream.max_fragment_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.distribution.redistribution_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "distribution.redistribution_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if let RequestLimitConfig::Aimd(aimd) = &self.log_stream.flow_control.request_limit {
            if aimd.min_limit == 0 || aimd.min_limit > aimd.max_limit {
                return Err(ConfigError::Invalid {
                    field: "log_stream.flow_control.request_limit",
                    reason: format!(
                        "min_limit {} must be positive and at most max_limit {}",
                        aimd.min_limit, aimd.max_limit
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.cluster.partition_count, 3);
        assert_eq!(config.distribution.redistribution_interval_ms, 10_000);
        assert_eq!(config.distribution.max_redistribution_interval_ms, 300_000);
        assert!(!config.log_stream.flow_control.write_rate.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_partitions_is_invalid() {
        let mut config = Config::for_test();
        config.cluster.partition_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "cluster.partition_count",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "cluster:\n  partition_count: 5\nlog_stream:\n  flow_control:\n    request_limit:\n      algorithm: fixed\n      limit: 7\n"
        )
        .unwrap();

        std::env::set_var("TIDELOG__SNAPSHOT__CHUNK_SIZE", "4096");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("TIDELOG__SNAPSHOT__CHUNK_SIZE");

        let config = config.unwrap();
        assert_eq!(config.cluster.partition_count, 5);
        assert_eq!(config.snapshot.chunk_size, 4096);
        assert!(matches!(
            config.log_stream.flow_control.request_limit,
            RequestLimitConfig::Fixed { limit: 7 }
        ));
    }
}
