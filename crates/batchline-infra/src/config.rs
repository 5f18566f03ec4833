//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.batchline/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use batchline_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - A zero `worker_pool_size` or `default_item_count` is raised to 1.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            config.worker_pool_size = config.worker_pool_size.max(1);
            config.default_item_count = config.default_item_count.max(1);
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// The configured database URL, or the default location.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
