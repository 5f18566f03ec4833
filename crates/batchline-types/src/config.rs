//! Engine configuration.
//!
//! `EngineConfig` represents the `config.toml` that tunes the engine: worker
//! pool size, checkpoint and transaction defaults, and the database location.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrently running steps and partitions.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Item-count checkpoint used when a chunk step declares none.
    #[serde(default = "default_item_count")]
    pub default_item_count: u32,

    /// Transaction timeout applied at each chunk begin, in seconds.
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,

    /// SQLite URL. `None` means the infra default location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Export tracing spans through OpenTelemetry.
    #[serde(default)]
    pub enable_otel: bool,
}

fn default_worker_pool_size() -> usize {
    16
}

fn default_item_count() -> u32 {
    10
}

fn default_transaction_timeout_secs() -> u64 {
    180
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            default_item_count: default_item_count(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            database_url: None,
            enable_otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.default_item_count, 10);
        assert_eq!(config.transaction_timeout_secs, 180);
        assert!(config.database_url.is_none());
        assert!(!config.enable_otel);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
worker_pool_size = 4
default_item_count = 25
database_url = "sqlite:///tmp/jobs.db"
enable_otel = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.default_item_count, 25);
        assert_eq!(config.transaction_timeout_secs, 180);
        assert_eq!(config.database_url.as_deref(), Some("sqlite:///tmp/jobs.db"));
        assert!(config.enable_otel);
    }
}
