//! XDG-compliant path management

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

/// Manages all application paths using XDG base directory specification
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directories from XDG
    dirs: ProjectDirs,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    /// Create a new Paths instance
    pub fn new() -> Self {
        let dirs =
            ProjectDirs::from("", "", "modforge").expect("Failed to determine project directories");
        Self { dirs }
    }

    /// Config directory: ~/.config/modforge/
    pub fn config_dir(&self) -> PathBuf {
        self.dirs.config_dir().to_path_buf()
    }

    /// Main config file: ~/.config/modforge/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    /// Cache directory: ~/.cache/modforge/
    pub fn cache_dir(&self) -> PathBuf {
        self.dirs.cache_dir().to_path_buf()
    }

    /// Portal metadata cache: ~/.cache/modforge/metadata.json
    pub fn metadata_cache_file(&self) -> PathBuf {
        self.cache_dir().join("metadata.json")
    }

    /// Default game mods directory: ~/.factorio/mods
    pub fn default_mods_dir(&self) -> PathBuf {
        BaseDirs::new()
            .map(|base| base.home_dir().join(".factorio").join("mods"))
            .unwrap_or_else(|| PathBuf::from(".factorio/mods"))
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }
}
