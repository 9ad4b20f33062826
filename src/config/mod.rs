//! Configuration management for ModForge
//!
//! Uses XDG-compliant paths:
//! - Config: ~/.config/modforge/config.toml
//! - Cache: ~/.cache/modforge/

mod paths;

pub use paths::Paths;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Override for the game mods directory (default: ~/.factorio/mods)
    pub mods_dir_override: Option<String>,

    /// Maximum concurrent downloads during batch updates
    pub update_concurrency: i64,

    /// Whether the Space Age DLC mods are owned and installable
    pub has_dlc: bool,

    /// Portal account name, required for downloads
    pub portal_username: Option<String>,

    /// Portal download token, required for downloads
    pub portal_token: Option<String>,

    /// Paths configuration
    #[serde(skip)]
    pub paths: Paths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mods_dir_override: None,
            update_concurrency: 3,
            has_dlc: false,
            portal_username: None,
            portal_token: None,
            paths: Paths::new(),
        }
    }
}

impl Config {
    /// Resolve the game mods directory (override or default)
    pub fn mods_dir(&self) -> PathBuf {
        self.mods_dir_override
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.default_mods_dir())
    }

    /// Ensure required directories exist, including the mods directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        self.paths
            .ensure_dirs()
            .context("Failed to create application directories")?;
        std::fs::create_dir_all(self.mods_dir()).context("Failed to create mods directory")?;
        Ok(())
    }

    /// Load configuration from disk or create default
    pub async fn load() -> Result<Self> {
        let paths = Paths::new();
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            config.save().await?;
            config
        };

        config.paths = paths;
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self) -> Result<()> {
        let config_path = self.paths.config_file();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_survive_partial_config() {
        let config: Config = toml::from_str("portal_username = \"engineer\"").unwrap();
        assert_eq!(config.portal_username.as_deref(), Some("engineer"));
        assert_eq!(config.update_concurrency, 3);
        assert!(!config.has_dlc);
        assert!(config.mods_dir_override.is_none());
    }

    #[test]
    fn test_override_wins_over_default_mods_dir() {
        let config: Config = toml::from_str("mods_dir_override = \"/srv/factorio/mods\"").unwrap();
        assert_eq!(config.mods_dir(), PathBuf::from("/srv/factorio/mods"));
    }
}
