//! Application settings

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use inst_link::{DriverConfig, InstrumentConfig, StaticRegistry};
use serde::{Deserialize, Serialize};

/// Settings file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Instruments that can be opened by id
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
    /// Driver tuning
    #[serde(default)]
    pub driver: DriverConfig,
    /// Poll period used by `stream` when none is given
    #[serde(default)]
    pub default_stream_period_secs: Option<f64>,
}

impl Settings {
    /// Get the XDG config directory for instlink
    /// Uses $XDG_CONFIG_HOME/instlink, falls back to ~/.config/instlink
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("instlink"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("instlink"))
    }

    /// Default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load settings from `path`, or the default location
    ///
    /// A missing file yields defaults; an unreadable or malformed one is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Save settings to `path`, or the default location
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(Self::default_path)
            .context("Could not determine settings path")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;

        Ok(path)
    }

    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::from_configs(self.instruments.iter().cloned())
    }
}
