//! Local mod repository - archive scanning, enable state, version swaps
//!
//! Installed mods live in one mods directory as `name_version.zip` archives
//! or unpacked directories, each carrying an `info.json` manifest. Enable
//! state is persisted in `mod-list.json` next to them, and every toggle is
//! written back immediately.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::deps::version;

/// The `info.json` manifest embedded in every mod archive or directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub factorio_version: Option<String>,
}

/// Read-only view of one installed mod.
#[derive(Debug, Clone)]
pub struct InstalledMod {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub title: String,
    pub path: PathBuf,
}

/// Point-in-time snapshot of the installed set, keyed case-insensitively.
///
/// Resolution works against a snapshot so the graph walk sees a consistent
/// view even while the orchestrator mutates the live set afterwards.
#[derive(Debug, Default, Clone)]
pub struct ModSnapshot {
    by_name: HashMap<String, InstalledMod>,
}

impl ModSnapshot {
    pub fn from_mods(mods: impl IntoIterator<Item = InstalledMod>) -> Self {
        let by_name = mods
            .into_iter()
            .map(|m| (m.name.to_lowercase(), m))
            .collect();
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Option<&InstalledMod> {
        self.by_name.get(&name.to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ModListFile {
    mods: Vec<ModListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModListEntry {
    name: String,
    enabled: bool,
}

/// Manages the on-disk mod set. All mutations go through `&self` methods
/// behind one lock, so concurrent update tasks never race on the list.
pub struct ModManager {
    mods_dir: PathBuf,
    mods: RwLock<HashMap<String, InstalledMod>>,
}

impl ModManager {
    pub fn new(mods_dir: PathBuf) -> Self {
        Self {
            mods_dir,
            mods: RwLock::new(HashMap::new()),
        }
    }

    pub fn mods_dir(&self) -> &Path {
        &self.mods_dir
    }

    /// Rescan the mods directory and rebuild the in-memory set.
    pub async fn refresh(&self) -> Result<()> {
        let dir = self.mods_dir.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_mods_dir(&dir))
            .await
            .context("Mod scan task panicked")??;

        let enabled_map = self.read_mod_list().await?;

        let mut mods = self.mods.write().await;
        mods.clear();
        for (manifest, path) in scanned {
            let key = manifest.name.to_lowercase();
            // Keep only the newest copy when several versions are present
            if let Some(existing) = mods.get(&key) {
                if !version::is_newer(&manifest.version, &existing.version) {
                    continue;
                }
            }
            let enabled = enabled_map.get(&key).copied().unwrap_or(true);
            mods.insert(
                key,
                InstalledMod {
                    title: manifest.title.clone().unwrap_or_else(|| manifest.name.clone()),
                    name: manifest.name,
                    version: manifest.version,
                    enabled,
                    path,
                },
            );
        }

        tracing::debug!("Scanned {} installed mods in {:?}", mods.len(), self.mods_dir);
        Ok(())
    }

    pub async fn list(&self) -> Vec<InstalledMod> {
        let mods = self.mods.read().await;
        let mut list: Vec<_> = mods.values().cloned().collect();
        list.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        list
    }

    pub async fn get(&self, name: &str) -> Option<InstalledMod> {
        self.mods.read().await.get(&name.to_lowercase()).cloned()
    }

    pub async fn snapshot(&self) -> ModSnapshot {
        ModSnapshot::from_mods(self.mods.read().await.values().cloned())
    }

    /// Set a mod's enabled flag and persist `mod-list.json` immediately.
    pub async fn toggle(&self, name: &str, enabled: bool) -> Result<()> {
        {
            let mut mods = self.mods.write().await;
            let entry = mods
                .get_mut(&name.to_lowercase())
                .with_context(|| format!("Mod '{}' is not installed", name))?;
            entry.enabled = enabled;
        }
        self.write_mod_list().await?;
        tracing::info!("{} {}", if enabled { "Enabled" } else { "Disabled" }, name);
        Ok(())
    }

    /// Record a freshly downloaded mod archive. New mods start enabled.
    pub async fn register_installed(
        &self,
        name: &str,
        title: &str,
        version: &str,
        path: PathBuf,
    ) -> Result<()> {
        {
            let mut mods = self.mods.write().await;
            mods.insert(
                name.to_lowercase(),
                InstalledMod {
                    name: name.to_string(),
                    version: version.to_string(),
                    enabled: true,
                    title: title.to_string(),
                    path,
                },
            );
        }
        self.write_mod_list().await
    }

    /// Swap a mod's record to a new version's archive, removing the old one.
    pub async fn apply_update(&self, name: &str, version: &str, new_path: PathBuf) -> Result<()> {
        let old_path = {
            let mut mods = self.mods.write().await;
            let entry = mods
                .get_mut(&name.to_lowercase())
                .with_context(|| format!("Mod '{}' is not installed", name))?;
            let old = entry.path.clone();
            entry.version = version.to_string();
            entry.path = new_path;
            old
        };

        if old_path.is_file() {
            if let Err(e) = tokio::fs::remove_file(&old_path).await {
                tracing::warn!("Could not remove superseded archive {:?}: {}", old_path, e);
            }
        }
        self.write_mod_list().await
    }

    fn mod_list_path(&self) -> PathBuf {
        self.mods_dir.join("mod-list.json")
    }

    async fn read_mod_list(&self) -> Result<HashMap<String, bool>> {
        let path = self.mod_list_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let list: ModListFile =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(list
            .mods
            .into_iter()
            .map(|entry| (entry.name.to_lowercase(), entry.enabled))
            .collect())
    }

    async fn write_mod_list(&self) -> Result<()> {
        let mut entries: Vec<ModListEntry> = {
            let mods = self.mods.read().await;
            mods.values()
                .map(|m| ModListEntry {
                    name: m.name.clone(),
                    enabled: m.enabled,
                })
                .collect()
        };
        entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

        let list = ModListFile { mods: entries };
        let content =
            serde_json::to_string_pretty(&list).context("Failed to serialize mod list")?;
        tokio::fs::create_dir_all(&self.mods_dir)
            .await
            .context("Failed to create mods directory")?;
        tokio::fs::write(self.mod_list_path(), content)
            .await
            .context("Failed to write mod-list.json")?;
        Ok(())
    }
}

/// Scan a mods directory for zip archives and unpacked mod directories.
fn scan_mods_dir(dir: &Path) -> Result<Vec<(ModManifest, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }

    for entry in WalkDir::new(dir).max_depth(1).min_depth(1) {
        let entry = entry.context("Failed to walk mods directory")?;
        let path = entry.path();

        if path.is_file() && path.extension().is_some_and(|ext| ext == "zip") {
            match read_manifest_from_zip(path) {
                Ok(manifest) => found.push((manifest, path.to_path_buf())),
                Err(e) => tracing::warn!("Skipping {:?}: {}", path, e),
            }
        } else if path.is_dir() {
            let info_path = path.join("info.json");
            if !info_path.is_file() {
                continue;
            }
            match read_manifest_from_file(&info_path) {
                Ok(manifest) => found.push((manifest, path.to_path_buf())),
                Err(e) => tracing::warn!("Skipping {:?}: {}", path, e),
            }
        }
    }

    Ok(found)
}

fn read_manifest_from_file(path: &Path) -> Result<ModManifest> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid manifest in {:?}", path))
}

/// Pull `info.json` out of a mod archive. The manifest sits inside the
/// archive's single top-level directory (`name_version/info.json`).
pub fn read_manifest_from_zip(path: &Path) -> Result<ModManifest> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut archive =
        zip::ZipArchive::new(file).with_context(|| format!("Not a zip archive: {:?}", path))?;

    let manifest_index = (0..archive.len()).find(|&i| {
        archive
            .by_index(i)
            .map(|entry| is_manifest_entry(entry.name()))
            .unwrap_or(false)
    });

    let Some(index) = manifest_index else {
        bail!("Archive has no info.json entry: {:?}", path);
    };

    let mut entry = archive.by_index(index)?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .context("Failed to read info.json from archive")?;
    serde_json::from_str(&content).with_context(|| format!("Invalid manifest in {:?}", path))
}

/// True for `info.json` at the archive root or one directory deep.
pub fn is_manifest_entry(entry_name: &str) -> bool {
    if entry_name == "info.json" {
        return true;
    }
    match entry_name.split_once('/') {
        Some((top, rest)) => !top.is_empty() && rest == "info.json",
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip_mod(dir: &Path, name: &str, version: &str, deps: &[&str]) -> PathBuf {
        let path = dir.join(format!("{}_{}.zip", name, version));
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file(format!("{}_{}/info.json", name, version), options)
            .unwrap();
        let manifest = serde_json::json!({
            "name": name,
            "version": version,
            "title": format!("{} Title", name),
            "dependencies": deps,
        });
        zip.write_all(manifest.to_string().as_bytes()).unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_is_manifest_entry() {
        assert!(is_manifest_entry("info.json"));
        assert!(is_manifest_entry("my-mod_1.0.0/info.json"));
        assert!(!is_manifest_entry("my-mod_1.0.0/data/info.json"));
        assert!(!is_manifest_entry("/info.json"));
        assert!(!is_manifest_entry("readme.txt"));
    }

    #[tokio::test]
    async fn test_scan_and_toggle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_zip_mod(dir.path(), "alpha", "1.2.0", &["base"]);
        write_zip_mod(dir.path(), "beta", "0.5.1", &[]);

        let manager = ModManager::new(dir.path().to_path_buf());
        manager.refresh().await.unwrap();

        let list = manager.list().await;
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|m| m.enabled));

        manager.toggle("Alpha", false).await.unwrap();
        assert!(!manager.get("alpha").await.unwrap().enabled);

        // Disabled state survives a rescan via mod-list.json
        manager.refresh().await.unwrap();
        assert!(!manager.get("alpha").await.unwrap().enabled);
        assert!(manager.get("beta").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_refresh_keeps_newest_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write_zip_mod(dir.path(), "alpha", "1.0.0", &[]);
        write_zip_mod(dir.path(), "alpha", "1.10.0", &[]);

        let manager = ModManager::new(dir.path().to_path_buf());
        manager.refresh().await.unwrap();

        let installed = manager.get("alpha").await.unwrap();
        assert_eq!(installed.version, "1.10.0");
    }

    #[tokio::test]
    async fn test_apply_update_removes_old_archive() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = write_zip_mod(dir.path(), "alpha", "1.0.0", &[]);
        let manager = ModManager::new(dir.path().to_path_buf());
        manager.refresh().await.unwrap();

        let new_path = write_zip_mod(dir.path(), "alpha", "2.0.0", &[]);
        manager
            .apply_update("alpha", "2.0.0", new_path.clone())
            .await
            .unwrap();

        assert!(!old_path.exists());
        let installed = manager.get("alpha").await.unwrap();
        assert_eq!(installed.version, "2.0.0");
        assert_eq!(installed.path, new_path);
    }
}
