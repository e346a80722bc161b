//! Configuration loading
//!
//! The engine config lives in a JSON file; a missing file means defaults.

use crate::error::EngineError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use vodfetch_types::EngineConfig;

/// Well-known directory for resume records
pub fn default_state_dir() -> PathBuf {
    ProjectDirs::from("io", "vodfetch", "vodfetch")
        .map(|dirs| dirs.data_dir().join("resume"))
        .unwrap_or_else(|| PathBuf::from(".vodfetch").join("resume"))
}

/// State directory the config points at, or the platform default
pub fn state_dir(config: &EngineConfig) -> PathBuf {
    config.state_dir.clone().unwrap_or_else(default_state_dir)
}

/// Load config from a JSON file, falling back to defaults when absent
pub async fn load_config(path: &Path) -> Result<EngineConfig, EngineError> {
    if !fs::try_exists(path).await? {
        debug!("No config at {:?}, using defaults", path);
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).await?;
    let config: EngineConfig = serde_json::from_str(&content)?;
    info!(
        "Loaded config from {:?} ({} provider(s))",
        path,
        config.providers.len()
    );
    Ok(config)
}
