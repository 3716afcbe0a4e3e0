//! Configuration loader for Weft.
//!
//! Reads `weft.toml` from the data directory (`~/.weft/` in production) and
//! deserializes it into [`WeftConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::{Path, PathBuf};

use weft_types::config::WeftConfig;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "weft.toml";

/// Resolve the data directory: `WEFT_DATA_DIR` if set, else `~/.weft`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WEFT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".weft")
}

/// Load configuration from `{data_dir}/weft.toml`.
///
/// - If the file does not exist, returns [`WeftConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> WeftConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No weft.toml found at {}, using defaults", config_path.display());
            return WeftConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return WeftConfig::default();
        }
    };

    match toml::from_str::<WeftConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            WeftConfig::default()
        }
    }
}
