// Configuration loader
// Loads agent settings from ~/.overlay-agent/config.toml or an explicit path

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::constants::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use super::settings::AgentSettings;

/// `~/.overlay-agent/config.toml`, if a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load settings.
///
/// An explicit `path` must exist. Without one, the default location is used
/// when present, otherwise built-in defaults apply.
pub fn load_settings(path: Option<&Path>) -> Result<AgentSettings> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let settings = match path {
        Some(path) => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let settings: AgentSettings = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            tracing::debug!(path = %path.display(), "Loaded agent settings");
            settings
        }
        None => AgentSettings::default(),
    };

    settings
        .validate()
        .context("Configuration validation failed")?;

    Ok(settings)
}
