//! Update orchestration
//!
//! Drives single and batch mod updates through a common pipeline: resolve
//! every target's dependency graph (with planned-version overrides so
//! in-batch updates satisfy each other's constraints), confirm and apply
//! the aggregated enable/disable/install plan, then download the targets
//! themselves with bounded concurrency.
//!
//! Failure semantics are asymmetric on purpose: anything that goes wrong
//! during dependency preparation aborts the whole batch before a single
//! target download starts, while a failed target download is isolated to
//! that target and merely recorded in the final summary.

pub mod progress;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cache::MetadataCache;
use crate::deps::resolver::{DependencyResolver, ResolutionResult};
use crate::deps::version;
use crate::mods::{InstalledMod, ModManager};
use crate::portal::{DownloadOutcome, ModDownloader, ModMetadataProvider};
use progress::{ProgressAggregator, ProgressCallback};

/// Blocking user interaction surface. Implementations decide how to ask;
/// the orchestrator only cares about the answer.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    async fn confirm(&self, title: &str, message: &str, yes: &str, no: &str) -> bool;
    async fn notify(&self, title: &str, message: &str);
}

/// Single updates prompt per target and download one at a time; batch
/// updates show one aggregated confirmation and download concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    Single,
    Batch,
}

/// One mod scheduled for update in the current batch.
#[derive(Debug, Clone)]
pub struct UpdateTarget {
    pub name: String,
    pub title: String,
    pub installed_version: String,
    pub target_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Updated,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub name: String,
    pub title: String,
    pub version: String,
    pub status: TargetStatus,
}

/// Per-batch result report.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<TargetOutcome>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TargetStatus::Updated)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{} updated, {} failed or skipped\n",
            self.succeeded(),
            self.failed()
        );
        for outcome in &self.outcomes {
            let line = match &outcome.status {
                TargetStatus::Updated => {
                    format!("- {} {}: updated", outcome.title, outcome.version)
                }
                TargetStatus::Failed(reason) => {
                    format!("- {} {}: failed ({})", outcome.title, outcome.version, reason)
                }
                TargetStatus::Cancelled => {
                    format!("- {} {}: cancelled", outcome.title, outcome.version)
                }
            };
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

/// Aggregated dependency plan across all targets in one batch.
/// First-seen wins for enable/disable decisions; missing installs keep
/// discovery order across targets with case-insensitive dedup.
#[derive(Default)]
struct BatchPlan {
    mods_to_enable: Vec<InstalledMod>,
    mods_to_disable: Vec<InstalledMod>,
    missing_to_install: Vec<String>,
    previews: Vec<String>,
    seen_enable: HashSet<String>,
    seen_disable: HashSet<String>,
    seen_missing: HashSet<String>,
}

impl BatchPlan {
    fn merge(&mut self, title: &str, result: ResolutionResult, preview: String) {
        let had_work = result.has_work();
        for m in result.mods_to_enable {
            if self.seen_enable.insert(m.name.to_lowercase()) {
                self.mods_to_enable.push(m);
            }
        }
        for m in result.mods_to_disable {
            if self.seen_disable.insert(m.name.to_lowercase()) {
                self.mods_to_disable.push(m);
            }
        }
        for name in result.missing_to_install {
            if self.seen_missing.insert(name.to_lowercase()) {
                self.missing_to_install.push(name);
            }
        }
        if had_work {
            self.previews.push(format!("{}:\n{}", title, preview));
        }
    }

    fn has_work(&self) -> bool {
        !self.mods_to_enable.is_empty()
            || !self.mods_to_disable.is_empty()
            || !self.missing_to_install.is_empty()
    }

    fn combined_preview(&self) -> String {
        self.previews.join("\n")
    }
}

/// Orchestrates dependency preparation and concurrent target downloads.
/// All collaborators are constructor-injected; nothing here reaches into
/// ambient global state.
pub struct UpdateOrchestrator {
    metadata: Arc<dyn ModMetadataProvider>,
    downloader: Arc<dyn ModDownloader>,
    mods: Arc<ModManager>,
    cache: Arc<MetadataCache>,
    prompt: Arc<dyn UserPrompt>,
    progress_callback: ProgressCallback,
    update_concurrency: i64,
    has_dlc: bool,
    cancel_root: CancellationToken,
}

impl UpdateOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<dyn ModMetadataProvider>,
        downloader: Arc<dyn ModDownloader>,
        mods: Arc<ModManager>,
        cache: Arc<MetadataCache>,
        prompt: Arc<dyn UserPrompt>,
        progress_callback: ProgressCallback,
        update_concurrency: i64,
        has_dlc: bool,
    ) -> Self {
        Self {
            metadata,
            downloader,
            mods,
            cache,
            prompt,
            progress_callback,
            update_concurrency,
            has_dlc,
            cancel_root: CancellationToken::new(),
        }
    }

    /// Cancel pending target downloads cooperatively. Dependency installs
    /// already in flight run to completion.
    pub fn cancel(&self) {
        self.cancel_root.cancel();
    }

    /// Update one mod to its latest known version.
    pub async fn update_single(&self, name: &str) -> Result<()> {
        let Some(installed) = self.mods.get(name).await else {
            self.prompt
                .notify("Update", &format!("Mod '{}' is not installed.", name))
                .await;
            return Ok(());
        };

        let latest = self
            .cache
            .get(&installed.name)
            .await
            .and_then(|meta| meta.latest_version)
            .filter(|latest| version::is_newer(latest, &installed.version));
        let Some(latest) = latest else {
            self.prompt
                .notify("Update", &format!("'{}' is already up to date.", installed.title))
                .await;
            return Ok(());
        };

        let target = UpdateTarget {
            name: installed.name.clone(),
            title: installed.title.clone(),
            installed_version: installed.version.clone(),
            target_version: latest,
        };
        self.update_mods_core(vec![target], BatchMode::Single)
            .await
            .map(|_| ())
    }

    /// Update every installed mod flagged as updatable, after one batch
    /// confirmation. Declining leaves everything untouched.
    pub async fn update_all(&self) -> Result<()> {
        let mut targets = Vec::new();
        for installed in self.mods.list().await {
            let Some(meta) = self.cache.get(&installed.name).await else {
                continue;
            };
            if !meta.has_update {
                continue;
            }
            let Some(latest) = meta.latest_version else {
                continue;
            };
            if version::is_newer(&latest, &installed.version) {
                targets.push(UpdateTarget {
                    name: installed.name.clone(),
                    title: installed.title.clone(),
                    installed_version: installed.version.clone(),
                    target_version: latest,
                });
            }
        }

        if targets.is_empty() {
            self.prompt
                .notify("Updates", "All mods are up to date.")
                .await;
            return Ok(());
        }

        let listing: Vec<String> = targets
            .iter()
            .map(|t| format!("- {} {} -> {}", t.title, t.installed_version, t.target_version))
            .collect();
        let message = format!(
            "Update {} mods?\n{}",
            targets.len(),
            listing.join("\n")
        );
        if !self
            .prompt
            .confirm("Update all mods", &message, "Update", "Cancel")
            .await
        {
            tracing::info!("Batch update declined");
            return Ok(());
        }

        self.update_mods_core(targets, BatchMode::Batch)
            .await
            .map(|_| ())
    }

    /// Install a mod after its dependency plan succeeds. The main install
    /// action never runs when a dependency install fails.
    pub async fn install_with_dependencies<F, Fut>(
        &self,
        mod_name: &str,
        install_main: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let snapshot = self.mods.snapshot().await;
        let resolver = DependencyResolver::new(self.metadata.as_ref(), &snapshot, self.has_dlc);
        let (result, preview) = resolver
            .resolve_with_preview(mod_name, None, &HashMap::new())
            .await;

        if !result.proceed {
            self.prompt
                .notify(
                    "Install aborted",
                    &format!("Could not resolve dependencies for '{}'.", mod_name),
                )
                .await;
            return Ok(());
        }

        if result.has_work() {
            let message = format!("Installing '{}' requires changes:\n\n{}", mod_name, preview);
            if !self
                .prompt
                .confirm("Dependencies required", &message, "Continue", "Cancel")
                .await
            {
                return Ok(());
            }

            for m in &result.mods_to_enable {
                self.mods.toggle(&m.name, true).await?;
            }
            for m in &result.mods_to_disable {
                self.mods.toggle(&m.name, false).await?;
            }
            for dep_name in &result.missing_to_install {
                if let Err(e) = self.install_dependency(dep_name).await {
                    tracing::error!("Dependency install failed for '{}': {:#}", dep_name, e);
                    self.prompt
                        .notify(
                            "Install aborted",
                            &format!(
                                "Failed to install dependency '{}': {}. \
                                 Some dependencies may already be installed.",
                                dep_name, e
                            ),
                        )
                        .await;
                    return Ok(());
                }
            }
        }

        install_main().await?;
        self.mods.refresh().await?;
        self.prompt
            .notify("Install complete", &format!("'{}' was installed.", mod_name))
            .await;
        Ok(())
    }

    /// Common pipeline: dependency preparation (all-or-nothing), then
    /// concurrent target downloads (failures isolated per target).
    async fn update_mods_core(
        &self,
        targets: Vec<UpdateTarget>,
        mode: BatchMode,
    ) -> Result<BatchSummary> {
        // A mod updated in this batch counts as already at its new version
        // for every other target's constraint checks.
        let overrides: HashMap<String, String> = targets
            .iter()
            .map(|t| (t.name.to_lowercase(), t.target_version.clone()))
            .collect();

        if !self.prepare_dependencies(&targets, &overrides, mode).await? {
            return Ok(BatchSummary::default());
        }

        let concurrency = effective_concurrency(mode, self.update_concurrency);
        tracing::info!(
            "Updating {} mods with concurrency {}",
            targets.len(),
            concurrency
        );

        let aggregator =
            ProgressAggregator::new(targets.len(), Arc::clone(&self.progress_callback));
        let cancel = self.cancel_root.child_token();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let outcomes = Arc::new(Mutex::new(Vec::with_capacity(targets.len())));
        let mut handles = Vec::new();

        for target in targets {
            let semaphore = Arc::clone(&semaphore);
            let orchestrator = self.clone_for_task();
            let aggregator = aggregator.clone();
            let cancel = cancel.clone();
            let outcomes = Arc::clone(&outcomes);

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let status = if cancel.is_cancelled() {
                    TargetStatus::Cancelled
                } else {
                    match orchestrator.update_one(&target, &aggregator, &cancel).await {
                        Ok(true) => TargetStatus::Updated,
                        Ok(false) => TargetStatus::Cancelled,
                        Err(e) => {
                            tracing::error!("Update failed for {}: {:#}", target.name, e);
                            TargetStatus::Failed(format!("{:#}", e))
                        }
                    }
                };
                aggregator.increment();
                outcomes.lock().await.push(TargetOutcome {
                    name: target.name,
                    title: target.title,
                    version: target.target_version,
                    status,
                });
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Update task panicked: {}", e);
            }
        }

        let summary = BatchSummary {
            outcomes: outcomes.lock().await.clone(),
        };
        self.prompt
            .notify("Update complete", &summary.render())
            .await;
        Ok(summary)
    }

    /// Resolve all targets, confirm the aggregated plan, apply toggles and
    /// install missing dependencies sequentially. Returns false when the
    /// batch must not proceed to downloads.
    async fn prepare_dependencies(
        &self,
        targets: &[UpdateTarget],
        overrides: &HashMap<String, String>,
        mode: BatchMode,
    ) -> Result<bool> {
        let snapshot = self.mods.snapshot().await;
        let resolver = DependencyResolver::new(self.metadata.as_ref(), &snapshot, self.has_dlc);

        let mut plan = BatchPlan::default();
        for target in targets {
            let (result, preview) = resolver
                .resolve_with_preview(&target.name, Some(&target.target_version), overrides)
                .await;
            if !result.proceed {
                self.prompt
                    .notify(
                        "Update aborted",
                        &format!(
                            "Could not resolve dependencies for {}. No mods were changed.",
                            target.title
                        ),
                    )
                    .await;
                return Ok(false);
            }
            if mode == BatchMode::Single && result.has_work() {
                let message = format!("{} requires changes:\n\n{}", target.title, preview);
                if !self
                    .prompt
                    .confirm("Dependencies required", &message, "Continue", "Cancel")
                    .await
                {
                    return Ok(false);
                }
            }
            plan.merge(&target.title, result, preview);
        }

        if !plan.has_work() {
            return Ok(true);
        }

        // Single mode already confirmed per target above. Enable/disable
        // decisions need approval even when nothing is missing.
        if mode == BatchMode::Batch
            && !self
                .prompt
                .confirm(
                    "Dependencies required",
                    &plan.combined_preview(),
                    "Continue",
                    "Cancel",
                )
                .await
        {
            return Ok(false);
        }

        // Mutations are applied before the concurrent phase starts, so
        // target tasks never race on the shared mod list.
        for m in &plan.mods_to_enable {
            self.mods.toggle(&m.name, true).await?;
        }
        for m in &plan.mods_to_disable {
            self.mods.toggle(&m.name, false).await?;
        }

        // Sequential and ordered: a later dependency may rely on an
        // earlier one being present. First failure aborts the batch.
        for dep_name in &plan.missing_to_install {
            if let Err(e) = self.install_dependency(dep_name).await {
                tracing::error!("Dependency install failed for '{}': {:#}", dep_name, e);
                self.prompt
                    .notify(
                        "Update aborted",
                        &format!(
                            "Failed to install dependency '{}': {}. \
                             Some dependencies may already be installed.",
                            dep_name, e
                        ),
                    )
                    .await;
                return Ok(false);
            }
        }

        if !plan.missing_to_install.is_empty() {
            self.mods.refresh().await?;
        }
        Ok(true)
    }

    /// Download and register one missing dependency at its latest release.
    /// Never interrupted mid-way, so the token it gets is never cancelled.
    async fn install_dependency(&self, name: &str) -> Result<()> {
        let portal_mod = self
            .metadata
            .get_mod(name)
            .await?
            .with_context(|| format!("No portal metadata for '{}'", name))?;
        let release = portal_mod
            .latest_release()
            .with_context(|| format!("'{}' has no releases", name))?;

        let outcome = self
            .downloader
            .download_mod(
                &portal_mod.name,
                &portal_mod.title,
                &release.version,
                &release.download_url,
                release.sha1.as_deref(),
                None,
                &CancellationToken::new(),
            )
            .await?;

        match outcome {
            DownloadOutcome::Completed(path) => {
                self.mods
                    .register_installed(&portal_mod.name, &portal_mod.title, &release.version, path)
                    .await?;
                tracing::info!("Installed dependency {} {}", portal_mod.title, release.version);
                Ok(())
            }
            DownloadOutcome::Cancelled => bail!("Download was cancelled"),
        }
    }

    /// Download and swap one target mod. Returns Ok(false) when cancelled.
    async fn update_one(
        &self,
        target: &UpdateTarget,
        aggregator: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let portal_mod = self
            .metadata
            .get_mod(&target.name)
            .await?
            .with_context(|| format!("No portal metadata for '{}'", target.name))?;
        let release = portal_mod
            .release_for(&target.target_version)
            .with_context(|| {
                format!("'{}' has no release {}", target.name, target.target_version)
            })?;

        // Per-mod scope: cancelling this token leaves siblings running.
        let task_token = cancel.child_token();
        let tracker = aggregator.track_download();
        let outcome = self
            .downloader
            .download_mod(
                &target.name,
                &target.title,
                &release.version,
                &release.download_url,
                release.sha1.as_deref(),
                Some(tracker.sink()),
                &task_token,
            )
            .await?;

        match outcome {
            DownloadOutcome::Completed(path) => {
                self.mods
                    .apply_update(&target.name, &release.version, path)
                    .await?;
                self.cache
                    .clear_update(&target.name, &release.version)
                    .await?;
                tracing::info!("Updated {} to {}", target.title, release.version);
                Ok(true)
            }
            DownloadOutcome::Cancelled => Ok(false),
        }
    }

    /// Clone necessary fields for an async task
    fn clone_for_task(&self) -> Self {
        Self {
            metadata: Arc::clone(&self.metadata),
            downloader: Arc::clone(&self.downloader),
            mods: Arc::clone(&self.mods),
            cache: Arc::clone(&self.cache),
            prompt: Arc::clone(&self.prompt),
            progress_callback: Arc::clone(&self.progress_callback),
            update_concurrency: self.update_concurrency,
            has_dlc: self.has_dlc,
            cancel_root: self.cancel_root.clone(),
        }
    }
}

/// Single updates always run alone; batch concurrency comes from settings
/// with non-positive values clamped to the default of 3.
fn effective_concurrency(mode: BatchMode, configured: i64) -> usize {
    match mode {
        BatchMode::Single => 1,
        BatchMode::Batch => {
            if configured <= 0 {
                3
            } else {
                configured as usize
            }
        }
    }
}
