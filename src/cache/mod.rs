//! Per-mod metadata cache
//!
//! Stores portal metadata that outlives one session - category, source URL,
//! latest known version, and update availability - in a single JSON file.
//! Every mutation is written back immediately.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::deps::version;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModMetadata {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub has_update: bool,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
}

pub struct MetadataCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, ModMetadata>>,
}

impl MetadataCache {
    /// Load the cache file, starting empty when it is missing or corrupt.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Resetting corrupt metadata cache: {}", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub async fn get(&self, name: &str) -> Option<ModMetadata> {
        self.entries.read().await.get(&name.to_lowercase()).cloned()
    }

    /// Record the outcome of one portal check for a mod.
    pub async fn record_check(
        &self,
        name: &str,
        category: Option<String>,
        source_url: Option<String>,
        latest_version: Option<String>,
        has_update: bool,
    ) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                name.to_lowercase(),
                ModMetadata {
                    category,
                    source_url,
                    latest_version,
                    has_update,
                    checked_at: Some(Utc::now()),
                },
            );
        }
        self.save().await
    }

    /// Re-evaluate update availability after a mod reached `installed_version`.
    pub async fn clear_update(&self, name: &str, installed_version: &str) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(&name.to_lowercase()) {
                entry.has_update = entry
                    .latest_version
                    .as_deref()
                    .map(|latest| version::is_newer(latest, installed_version))
                    .unwrap_or(false);
            } else {
                return Ok(());
            }
        }
        self.save().await
    }

    /// Names of cached mods currently flagged as updatable.
    pub async fn mods_with_updates(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, meta)| meta.has_update)
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn save(&self) -> Result<()> {
        let content = {
            let entries = self.entries.read().await;
            serde_json::to_string_pretty(&*entries).context("Failed to serialize metadata cache")?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create cache directory")?;
        }
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_clear_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let cache = MetadataCache::load(path.clone()).await.unwrap();
        cache
            .record_check(
                "Flib",
                Some("internal".to_string()),
                None,
                Some("2.0.0".to_string()),
                true,
            )
            .await
            .unwrap();

        // Reload from disk, case-insensitive lookup
        let cache = MetadataCache::load(path).await.unwrap();
        let meta = cache.get("flib").await.unwrap();
        assert!(meta.has_update);
        assert_eq!(meta.latest_version.as_deref(), Some("2.0.0"));
        assert_eq!(cache.mods_with_updates().await, vec!["flib".to_string()]);

        cache.clear_update("flib", "2.0.0").await.unwrap();
        assert!(!cache.get("flib").await.unwrap().has_update);
        assert!(cache.mods_with_updates().await.is_empty());

        // Unknown mods are a no-op
        cache.clear_update("ghost", "1.0").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_cache_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let cache = MetadataCache::load(path).await.unwrap();
        assert!(cache.get("anything").await.is_none());
    }
}
