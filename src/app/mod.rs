//! Application wiring and CLI command handlers

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::deps::resolver::DependencyResolver;
use crate::deps::version;
use crate::mods::ModManager;
use crate::portal::{DownloadOutcome, Downloader, ModDownloader, ModMetadataProvider, PortalClient};
use crate::ui::{progress_bar_callback, TerminalPrompt};
use crate::update::UpdateOrchestrator;
use tokio_util::sync::CancellationToken;

/// Main application struct that wires all components together
pub struct App {
    config: Config,
    mods: Arc<ModManager>,
    cache: Arc<MetadataCache>,
    portal: Arc<PortalClient>,
    downloader: Arc<Downloader>,
    orchestrator: UpdateOrchestrator,
}

impl App {
    /// Create a new App instance
    pub async fn new(config: Config, assume_yes: bool) -> Result<Self> {
        config.ensure_dirs().context("Failed to create directories")?;

        let mods = Arc::new(ModManager::new(config.mods_dir()));
        mods.refresh().await.context("Failed to scan mods directory")?;

        let cache = Arc::new(MetadataCache::load(config.paths.metadata_cache_file()).await?);
        let portal = Arc::new(PortalClient::new()?);
        let downloader = Arc::new(Downloader::new(
            config.mods_dir(),
            config.portal_username.clone(),
            config.portal_token.clone(),
        )?);

        let orchestrator = UpdateOrchestrator::new(
            Arc::clone(&portal) as Arc<dyn ModMetadataProvider>,
            Arc::clone(&downloader) as Arc<dyn ModDownloader>,
            Arc::clone(&mods),
            Arc::clone(&cache),
            Arc::new(TerminalPrompt::new(assume_yes)),
            progress_bar_callback(),
            config.update_concurrency,
            config.has_dlc,
        );

        Ok(Self {
            config,
            mods,
            cache,
            portal,
            downloader,
            orchestrator,
        })
    }

    /// List installed mods with enabled state and update availability.
    pub async fn cmd_list(&self) -> Result<()> {
        let mods = self.mods.list().await;
        if mods.is_empty() {
            println!("No mods installed in {:?}", self.config.mods_dir());
            return Ok(());
        }

        for installed in &mods {
            let state = if installed.enabled { "enabled " } else { "disabled" };
            let update = match self.cache.get(&installed.name).await {
                Some(meta) if meta.has_update => match meta.latest_version {
                    Some(latest) => format!("  update available: {}", latest),
                    None => "  update available".to_string(),
                },
                _ => String::new(),
            };
            println!(
                "{:<40} {:<12} {}{}",
                installed.title, installed.version, state, update
            );
        }
        let updates = self.cache.mods_with_updates().await;
        if updates.is_empty() {
            println!("\n{} mods installed", mods.len());
        } else {
            println!(
                "\n{} mods installed, {} with updates available",
                mods.len(),
                updates.len()
            );
        }
        Ok(())
    }

    /// Check the portal for newer releases of every installed mod.
    pub async fn cmd_sync(&self) -> Result<()> {
        self.mods.refresh().await?;
        let mods = self.mods.list().await;
        println!("Checking {} mods against the portal...", mods.len());

        let mut updates = 0usize;
        for installed in &mods {
            let portal_mod = match self.portal.get_mod(&installed.name).await {
                Ok(Some(m)) => m,
                Ok(None) => {
                    tracing::debug!("'{}' is not on the portal", installed.name);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Portal check failed for '{}': {:#}", installed.name, e);
                    continue;
                }
            };

            let latest = portal_mod.latest_release().map(|r| r.version.clone());
            let has_update = latest
                .as_deref()
                .map(|latest| version::is_newer(latest, &installed.version))
                .unwrap_or(false);
            if has_update {
                updates += 1;
                println!(
                    "  {} {} -> {}",
                    installed.title,
                    installed.version,
                    latest.as_deref().unwrap_or("?")
                );
            }
            self.cache
                .record_check(
                    &installed.name,
                    portal_mod.category.clone(),
                    portal_mod.source_url.clone(),
                    latest,
                    has_update,
                )
                .await?;
        }

        if updates == 0 {
            println!("All mods are up to date.");
        } else {
            println!("{} updates available. Run 'modforge update --all'.", updates);
        }
        Ok(())
    }

    /// Update a single mod to its latest known version.
    pub async fn cmd_update(&self, name: &str) -> Result<()> {
        self.orchestrator.update_single(name).await
    }

    /// Update everything flagged as updatable.
    pub async fn cmd_update_all(&self) -> Result<()> {
        self.orchestrator.update_all().await
    }

    /// Install a mod from the portal, with its dependency chain.
    pub async fn cmd_install(&self, name: &str) -> Result<()> {
        if let Some(installed) = self.mods.get(name).await {
            println!("'{}' {} is already installed.", installed.title, installed.version);
            return Ok(());
        }

        let portal_mod = self
            .portal
            .get_mod(name)
            .await?
            .with_context(|| format!("Mod '{}' was not found on the portal", name))?;
        let release = portal_mod
            .latest_release()
            .with_context(|| format!("'{}' has no releases", name))?
            .clone();

        let downloader = Arc::clone(&self.downloader);
        let mods = Arc::clone(&self.mods);
        let title = portal_mod.title.clone();
        let mod_name = portal_mod.name.clone();
        self.orchestrator
            .install_with_dependencies(name, move || async move {
                let outcome = downloader
                    .download_mod(
                        &mod_name,
                        &title,
                        &release.version,
                        &release.download_url,
                        release.sha1.as_deref(),
                        None,
                        &CancellationToken::new(),
                    )
                    .await?;
                match outcome {
                    DownloadOutcome::Completed(path) => {
                        mods.register_installed(&mod_name, &title, &release.version, path)
                            .await
                    }
                    DownloadOutcome::Cancelled => bail!("Download was cancelled"),
                }
            })
            .await
    }

    /// Enable a mod together with any disabled mandatory dependencies.
    pub async fn cmd_enable(&self, name: &str) -> Result<()> {
        let Some(installed) = self.mods.get(name).await else {
            bail!("Mod '{}' is not installed", name);
        };
        self.mods.toggle(&installed.name, true).await?;

        let snapshot = self.mods.snapshot().await;
        let resolver =
            DependencyResolver::new(self.portal.as_ref(), &snapshot, self.config.has_dlc);
        let result = resolver.resolve(&installed.name, None, &HashMap::new()).await;

        if result.proceed {
            for m in &result.mods_to_enable {
                self.mods.toggle(&m.name, true).await?;
                println!("Enabled dependency '{}'", m.title);
            }
            if !result.missing_to_install.is_empty() {
                println!(
                    "Missing dependencies: {}. Run 'modforge install' to fetch them.",
                    result.missing_to_install.join(", ")
                );
            }
            for warning in &result.dlc_warnings {
                println!("Warning: {}", warning);
            }
        } else {
            tracing::warn!("Dependency check for '{}' was inconclusive", installed.name);
        }

        println!("Enabled '{}'", installed.title);
        Ok(())
    }

    /// Disable a mod.
    pub async fn cmd_disable(&self, name: &str) -> Result<()> {
        let Some(installed) = self.mods.get(name).await else {
            bail!("Mod '{}' is not installed", name);
        };
        self.mods.toggle(&installed.name, false).await?;
        println!("Disabled '{}'", installed.title);
        Ok(())
    }
}
