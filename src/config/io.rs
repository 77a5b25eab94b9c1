//! Config I/O operations: load and save.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::config_struct::Config;

// ============================================================================
// CONFIG PATH
// ============================================================================

/// Get the config file path
pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_default().join("live-voice");
    let _ = std::fs::create_dir_all(&config_dir);
    config_dir.join("config.json")
}

// ============================================================================
// CONFIG LOADING
// ============================================================================

/// Load config from disk, falling back to defaults
pub fn load_config() -> Config {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Config {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Config::default();
    }

    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) => {
            warn!(path = %path.display(), "failed to read config: {}", e);
            return Config::default();
        }
    };

    match serde_json::from_str(&data) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), "invalid config, using defaults: {}", e);
            Config::default()
        }
    }
}

// ============================================================================
// CONFIG SAVING
// ============================================================================

/// Save config to disk
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    save_config_to(config, &get_config_path())
}

pub fn save_config_to(config: &Config, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)?;
    Ok(())
}
