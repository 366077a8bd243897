// Configuration file management for the gattlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/gattlink/config.json
// - Linux: ~/.config/gattlink/config.json
// - Windows: %APPDATA%\gattlink\config.json

use anyhow::{Context, Result};
use gattlink_core::GattLinkConfig;
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("gattlink");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Resolve an explicit path or fall back to the default location
pub fn resolve(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => config_file(),
    }
}

/// Load config from a file; a missing file yields the defaults
pub fn load_from(path: &Path) -> Result<GattLinkConfig> {
    if !path.exists() {
        return Ok(GattLinkConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    GattLinkConfig::from_json(&contents)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

/// Save config to a file, creating parent directories as needed
pub fn save_to(config: &GattLinkConfig, path: &Path) -> Result<()> {
    config.validate().context("Refusing to save invalid config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let contents = config.to_json().context("Failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}
