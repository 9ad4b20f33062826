//! Dependency graph resolution
//!
//! Given a target mod (and, for updates, a target version), walks the
//! mandatory-dependency graph against the installed set and computes which
//! mods must additionally be installed, enabled, or disabled. The walk uses
//! an explicit frame stack rather than async recursion, but reproduces
//! depth-first recursion order exactly: a missing dependency is recorded the
//! moment it is discovered, then fully expanded before its next sibling.
//!
//! Known limitation: a name is resolved at most once per call ("first seen
//! wins"). In diamond-shaped graphs the branch explored first decides how a
//! shared dependency is reported; downstream confirmation text depends on
//! that traversal order, so it is deliberately not re-expanded.

use anyhow::Result;
use std::collections::{HashMap, HashSet};

use super::spec::{self, DependencyDeclaration};
use crate::mods::{InstalledMod, ModSnapshot};
use crate::portal::{ModMetadataProvider, PortalRelease};

/// Outcome of one resolution call. Built incrementally, immutable once
/// returned.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    /// False aborts the whole operation (missing release data, unknown
    /// target version, transport failure).
    pub proceed: bool,
    /// Disabled mandatory dependencies that must be turned on.
    pub mods_to_enable: Vec<InstalledMod>,
    /// Enabled mods declared incompatible with the target.
    pub mods_to_disable: Vec<InstalledMod>,
    /// Names not satisfiable locally, in discovery order, deduplicated
    /// case-insensitively. Never contains the target's own name.
    pub missing_to_install: Vec<String>,
    /// Non-blocking notes about DLC dependencies the game cannot satisfy.
    pub dlc_warnings: Vec<String>,
}

impl ResolutionResult {
    fn abort() -> Self {
        Self::default()
    }

    pub fn has_work(&self) -> bool {
        !self.mods_to_enable.is_empty()
            || !self.mods_to_disable.is_empty()
            || !self.missing_to_install.is_empty()
    }
}

/// Resolves one target mod's dependency graph against a snapshot of the
/// installed set, with planned-version overrides for in-batch updates.
pub struct DependencyResolver<'a> {
    metadata: &'a dyn ModMetadataProvider,
    installed: &'a ModSnapshot,
    has_dlc: bool,
}

struct Frame {
    name: String,
    children: std::vec::IntoIter<DependencyDeclaration>,
}

/// Mutable state scoped to one top-level resolution call.
struct Walk {
    root_enabled: bool,
    visited: HashSet<String>,
    seen_missing: HashSet<String>,
    seen_enable: HashSet<String>,
    seen_disable: HashSet<String>,
    result: ResolutionResult,
    tree: HashMap<String, Vec<String>>,
    edge_labels: HashMap<(String, String), String>,
}

impl Walk {
    fn new(root_enabled: bool) -> Self {
        Self {
            root_enabled,
            visited: HashSet::new(),
            seen_missing: HashSet::new(),
            seen_enable: HashSet::new(),
            seen_disable: HashSet::new(),
            result: ResolutionResult::default(),
            tree: HashMap::new(),
            edge_labels: HashMap::new(),
        }
    }
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        metadata: &'a dyn ModMetadataProvider,
        installed: &'a ModSnapshot,
        has_dlc: bool,
    ) -> Self {
        Self {
            metadata,
            installed,
            has_dlc,
        }
    }

    /// Resolve `root_name` for install (`target_version` = None, latest
    /// release) or update (exact `target_version`).
    ///
    /// Recoverable conditions come back as data; unexpected failures are
    /// logged and collapse to `proceed: false` instead of propagating.
    pub async fn resolve(
        &self,
        root_name: &str,
        target_version: Option<&str>,
        overrides: &HashMap<String, String>,
    ) -> ResolutionResult {
        self.resolve_with_preview(root_name, target_version, overrides)
            .await
            .0
    }

    /// Same resolution, plus a human-readable dependency preview.
    pub async fn resolve_with_preview(
        &self,
        root_name: &str,
        target_version: Option<&str>,
        overrides: &HashMap<String, String>,
    ) -> (ResolutionResult, String) {
        // Only the top-level target's enabled state gates enable/disable
        // side effects for the entire call tree. A mod that is not
        // installed yet is destined to end up enabled.
        let root_enabled = self
            .installed
            .lookup(root_name)
            .map(|m| m.enabled)
            .unwrap_or(true);
        let mut walk = Walk::new(root_enabled);

        match self.walk_graph(root_name, target_version, overrides, &mut walk).await {
            Ok(true) => walk.result.proceed = true,
            Ok(false) => walk.result = ResolutionResult::abort(),
            Err(e) => {
                tracing::error!("Dependency resolution for '{}' failed: {:#}", root_name, e);
                walk.result = ResolutionResult::abort();
            }
        }

        let preview = render_preview(root_name, &walk);
        (walk.result, preview)
    }

    /// Depth-first walk. Returns Ok(false) when any node cannot be
    /// resolved, which aborts the whole call.
    async fn walk_graph(
        &self,
        root_name: &str,
        target_version: Option<&str>,
        overrides: &HashMap<String, String>,
        walk: &mut Walk,
    ) -> Result<bool> {
        let Some(children) = self
            .expand_node(root_name, target_version, overrides, walk)
            .await?
        else {
            return Ok(false);
        };

        let mut stack = vec![Frame {
            name: root_name.to_string(),
            children: children.into_iter(),
        }];

        loop {
            let next = match stack.last_mut() {
                None => break,
                Some(frame) => frame.children.next().map(|dep| (frame.name.clone(), dep)),
            };
            let Some((parent, dep)) = next else {
                stack.pop();
                continue;
            };
            let key = dep.name.to_lowercase();

            // Self-dependencies are malformed portal metadata; drop them.
            if key == parent.to_lowercase() {
                tracing::warn!("Ignoring self-dependency declared by '{}'", parent);
                continue;
            }
            // First resolution wins; a visited name is already settled.
            if walk.visited.contains(&key) {
                tracing::info!("Dependency '{}' already resolved in this pass", dep.name);
                continue;
            }

            if walk.seen_missing.insert(key) {
                walk.result.missing_to_install.push(dep.name.clone());
            }
            walk.tree
                .entry(parent.clone())
                .or_default()
                .push(dep.name.clone());
            if let Some(label) = dep.constraint_label() {
                walk.edge_labels.insert((parent, dep.name.clone()), label);
            }

            // A broken sub-dependency aborts the parent resolution.
            let Some(grandchildren) = self.expand_node(&dep.name, None, overrides, walk).await?
            else {
                return Ok(false);
            };
            stack.push(Frame {
                name: dep.name,
                children: grandchildren.into_iter(),
            });
        }

        Ok(true)
    }

    /// Classify one node's dependencies against the installed set.
    ///
    /// Returns `Ok(None)` when the node cannot be resolved (no portal data,
    /// no releases, or no release matching the target version). Otherwise
    /// returns the node's missing children - the entries that still need a
    /// satisfying copy installed - in manifest order.
    async fn expand_node(
        &self,
        name: &str,
        target_version: Option<&str>,
        overrides: &HashMap<String, String>,
        walk: &mut Walk,
    ) -> Result<Option<Vec<DependencyDeclaration>>> {
        walk.visited.insert(name.to_lowercase());

        let Some(portal_mod) = self.metadata.get_mod(name).await? else {
            tracing::warn!("No portal metadata for '{}'", name);
            return Ok(None);
        };

        let release: &PortalRelease = match target_version {
            Some(version) => match portal_mod.release_for(version) {
                Some(release) => release,
                None => {
                    tracing::warn!("'{}' has no release {}", name, version);
                    return Ok(None);
                }
            },
            None => match portal_mod.latest_release() {
                Some(release) => release,
                None => {
                    tracing::warn!("'{}' has no releases on the portal", name);
                    return Ok(None);
                }
            },
        };

        let mandatory = spec::mandatory_dependencies(&release.info.dependencies);
        let incompatible = spec::incompatible_names(&release.info.dependencies);

        let mut missing_children = Vec::new();
        for dep in mandatory {
            if spec::is_game_dependency(&dep.name) {
                if spec::is_dlc_dependency(&dep.name) && !self.has_dlc {
                    walk.result.dlc_warnings.push(format!(
                        "'{}' requires the '{}' DLC, which is not enabled for this game",
                        name, dep.name
                    ));
                }
                continue;
            }

            let installed = self.installed.lookup(&dep.name);
            // A version planned for this batch supersedes the on-disk one.
            let effective_version = overrides
                .get(&dep.name.to_lowercase())
                .map(String::as_str)
                .or_else(|| installed.map(|m| m.version.as_str()));

            match installed {
                None => missing_children.push(dep),
                Some(installed_mod) => {
                    if !spec::satisfies_constraint(
                        effective_version,
                        dep.operator,
                        dep.version.as_deref(),
                    ) {
                        // Needs a satisfying copy installed; planning-wise
                        // the same as not installed at all.
                        missing_children.push(dep);
                    } else if !installed_mod.enabled {
                        if walk.root_enabled
                            && walk.seen_enable.insert(installed_mod.name.to_lowercase())
                        {
                            walk.result.mods_to_enable.push(installed_mod.clone());
                        }
                    }
                }
            }
        }

        for conflict in incompatible {
            if let Some(loaded) = self.installed.lookup(&conflict) {
                if loaded.enabled
                    && walk.root_enabled
                    && walk.seen_disable.insert(loaded.name.to_lowercase())
                {
                    walk.result.mods_to_disable.push(loaded.clone());
                }
            }
        }

        Ok(Some(missing_children))
    }
}

/// Render the human-readable dependency preview for a finished walk.
fn render_preview(root_name: &str, walk: &Walk) -> String {
    let mut out = String::new();

    let root_children = walk.tree.get(root_name);
    match root_children {
        Some(children) if !children.is_empty() => {
            out.push_str("Dependency Tree:\n");
            render_subtree(walk, root_name, children, 0, &mut out);
        }
        _ => out.push_str("No missing dependencies were found.\n"),
    }

    if !walk.result.mods_to_enable.is_empty() {
        out.push_str("\nDisabled Dependencies to be Enabled:\n");
        for m in &walk.result.mods_to_enable {
            out.push_str(&format!("- {}\n", m.title));
        }
    }

    if !walk.result.mods_to_disable.is_empty() {
        out.push_str("\nIncompatible Mods to be Disabled:\n");
        for m in &walk.result.mods_to_disable {
            out.push_str(&format!("- {}\n", m.title));
        }
    }

    if !walk.result.dlc_warnings.is_empty() {
        out.push_str("\nWarnings:\n");
        for warning in &walk.result.dlc_warnings {
            out.push_str(&format!("- {}\n", warning));
        }
    }

    out
}

fn render_subtree(walk: &Walk, parent: &str, children: &[String], depth: usize, out: &mut String) {
    for child in children {
        let label = walk
            .edge_labels
            .get(&(parent.to_string(), child.clone()))
            .map(|l| format!(" {}", l))
            .unwrap_or_default();
        out.push_str(&format!("{}- {}{}\n", " ".repeat(depth * 4), child, label));
        if let Some(grandchildren) = walk.tree.get(child) {
            render_subtree(walk, child, grandchildren, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::{PortalMod, PortalRelease, ReleaseInfo};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    /// In-memory portal with a fixed release per mod.
    struct FakePortal {
        mods: HashMap<String, PortalMod>,
        broken: HashSet<String>,
    }

    impl FakePortal {
        fn new() -> Self {
            Self {
                mods: HashMap::new(),
                broken: HashSet::new(),
            }
        }

        fn with_mod(mut self, name: &str, versions: &[(&str, &[&str])]) -> Self {
            let releases = versions
                .iter()
                .enumerate()
                .map(|(i, (version, deps))| PortalRelease {
                    version: version.to_string(),
                    released_at: Utc.with_ymd_and_hms(2024, 1, 1 + i as u32, 0, 0, 0).unwrap(),
                    download_url: format!("/download/{}/{}", name, version),
                    sha1: None,
                    info: ReleaseInfo {
                        dependencies: deps.iter().map(|d| d.to_string()).collect(),
                        factorio_version: None,
                    },
                })
                .collect();
            self.mods.insert(
                name.to_string(),
                PortalMod {
                    name: name.to_string(),
                    title: format!("{} Title", name),
                    category: None,
                    source_url: None,
                    changelog: None,
                    releases,
                },
            );
            self
        }

        fn with_transport_failure(mut self, name: &str) -> Self {
            self.broken.insert(name.to_string());
            self
        }
    }

    #[async_trait]
    impl ModMetadataProvider for FakePortal {
        async fn get_mod(&self, name: &str) -> Result<Option<PortalMod>> {
            if self.broken.contains(name) {
                return Err(anyhow!("connection reset"));
            }
            Ok(self.mods.get(name).cloned())
        }
    }

    fn installed(name: &str, version: &str, enabled: bool) -> InstalledMod {
        InstalledMod {
            name: name.to_string(),
            version: version.to_string(),
            enabled,
            title: format!("{} Title", name),
            path: PathBuf::from(format!("{}_{}.zip", name, version)),
        }
    }

    fn no_overrides() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_scenario_missing_disabled_incompatible() {
        // Installed: A@1.0 enabled, C@1.0 disabled, D enabled.
        // A@2.0 requires B (missing), C >= 1.0 (disabled), conflicts with D.
        let portal = FakePortal::new()
            .with_mod("A", &[("2.0", &["base", "B", "C >= 1.0", "! D"])])
            .with_mod("B", &[("1.0", &["base"])]);
        let snapshot = ModSnapshot::from_mods([
            installed("A", "1.0", true),
            installed("C", "1.0", false),
            installed("D", "1.0", true),
        ]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("A", Some("2.0"), &no_overrides()).await;
        assert!(result.proceed);
        assert_eq!(result.missing_to_install, vec!["B".to_string()]);
        assert_eq!(result.mods_to_enable.len(), 1);
        assert_eq!(result.mods_to_enable[0].name, "C");
        assert_eq!(result.mods_to_disable.len(), 1);
        assert_eq!(result.mods_to_disable[0].name, "D");
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let portal = FakePortal::new()
            .with_mod("A", &[("1.0", &["B"])])
            .with_mod("B", &[("1.0", &["A"])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("A", None, &no_overrides()).await;
        assert!(result.proceed);
        // B is missing; A is the root and never reports itself.
        assert_eq!(result.missing_to_install, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_self_dependency_is_dropped() {
        let portal = FakePortal::new().with_mod("X", &[("1.0", &["X", "base"])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("X", None, &no_overrides()).await;
        assert!(result.proceed);
        assert!(result.missing_to_install.is_empty());
    }

    #[tokio::test]
    async fn test_planned_override_satisfies_constraint() {
        let portal = FakePortal::new()
            .with_mod("root", &[("3.0", &["B >= 2.0"])])
            .with_mod("B", &[("2.0", &[])]);
        let snapshot = ModSnapshot::from_mods([
            installed("root", "2.0", true),
            installed("B", "1.0", false),
        ]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        // Without the override the stale on-disk version fails the check.
        let result = resolver.resolve("root", Some("3.0"), &no_overrides()).await;
        assert!(result.proceed);
        assert_eq!(result.missing_to_install, vec!["B".to_string()]);

        // With B planned at 2.0 in the same batch, the constraint holds and
        // the disabled copy is merely enabled.
        let mut overrides = HashMap::new();
        overrides.insert("b".to_string(), "2.0".to_string());
        let result = resolver.resolve("root", Some("3.0"), &overrides).await;
        assert!(result.proceed);
        assert!(result.missing_to_install.is_empty());
        assert_eq!(result.mods_to_enable.len(), 1);
        assert_eq!(result.mods_to_enable[0].name, "B");
    }

    #[tokio::test]
    async fn test_game_dependency_never_surfaces() {
        let portal = FakePortal::new().with_mod("m", &[("1.0", &["base >= 1.1"])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, false);

        let result = resolver.resolve("m", None, &no_overrides()).await;
        assert!(result.proceed);
        assert!(result.missing_to_install.is_empty());
        assert!(result.mods_to_enable.is_empty());
        assert!(result.mods_to_disable.is_empty());
        assert!(result.dlc_warnings.is_empty());
    }

    #[tokio::test]
    async fn test_dlc_dependency_warns_without_blocking() {
        let portal = FakePortal::new().with_mod("m", &[("1.0", &["space-age"])]);
        let snapshot = ModSnapshot::from_mods([]);

        let resolver = DependencyResolver::new(&portal, &snapshot, false);
        let result = resolver.resolve("m", None, &no_overrides()).await;
        assert!(result.proceed);
        assert!(result.missing_to_install.is_empty());
        assert_eq!(result.dlc_warnings.len(), 1);
        assert!(result.dlc_warnings[0].contains("space-age"));

        // With the entitlement there is nothing to warn about.
        let resolver = DependencyResolver::new(&portal, &snapshot, true);
        let result = resolver.resolve("m", None, &no_overrides()).await;
        assert!(result.dlc_warnings.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_root_gates_side_effects() {
        let portal = FakePortal::new().with_mod("root", &[("1.0", &["dep", "! enemy"])]);
        let snapshot = ModSnapshot::from_mods([
            installed("root", "0.9", false),
            installed("dep", "1.0", false),
            installed("enemy", "1.0", true),
        ]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("root", Some("1.0"), &no_overrides()).await;
        assert!(result.proceed);
        // The root itself will not end up active, so nothing is toggled on
        // its behalf.
        assert!(result.mods_to_enable.is_empty());
        assert!(result.mods_to_disable.is_empty());
    }

    #[tokio::test]
    async fn test_missing_release_data_aborts() {
        let portal = FakePortal::new().with_mod("root", &[("1.0", &["ghost"])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        // "ghost" is unknown to the portal: the whole resolution aborts.
        let result = resolver.resolve("root", None, &no_overrides()).await;
        assert!(!result.proceed);
        assert!(result.missing_to_install.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_version_aborts() {
        let portal = FakePortal::new().with_mod("root", &[("1.0", &[])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("root", Some("9.9"), &no_overrides()).await;
        assert!(!result.proceed);
    }

    #[tokio::test]
    async fn test_transport_failure_collapses_to_abort() {
        let portal = FakePortal::new().with_transport_failure("root");
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("root", None, &no_overrides()).await;
        assert!(!result.proceed);
    }

    #[tokio::test]
    async fn test_discovery_order_is_depth_first() {
        // root -> [first, second]; first -> [nested]. Recursion order puts
        // nested before second.
        let portal = FakePortal::new()
            .with_mod("root", &[("1.0", &["first", "second"])])
            .with_mod("first", &[("1.0", &["nested"])])
            .with_mod("second", &[("1.0", &[])])
            .with_mod("nested", &[("1.0", &[])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("root", None, &no_overrides()).await;
        assert!(result.proceed);
        assert_eq!(
            result.missing_to_install,
            vec!["first".to_string(), "nested".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn test_diamond_resolves_each_name_once() {
        let portal = FakePortal::new()
            .with_mod("root", &[("1.0", &["left", "right"])])
            .with_mod("left", &[("1.0", &["shared"])])
            .with_mod("right", &[("1.0", &["shared"])])
            .with_mod("shared", &[("1.0", &[])]);
        let snapshot = ModSnapshot::from_mods([]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("root", None, &no_overrides()).await;
        assert!(result.proceed);
        assert_eq!(
            result.missing_to_install,
            vec!["left".to_string(), "shared".to_string(), "right".to_string()]
        );
    }

    #[tokio::test]
    async fn test_preview_tree_rendering() {
        let portal = FakePortal::new()
            .with_mod("root", &[("1.0", &["first >= 1.2.0", "second"])])
            .with_mod("first", &[("1.0", &["nested"])])
            .with_mod("second", &[("1.0", &[])])
            .with_mod("nested", &[("1.0", &[])]);
        let snapshot = ModSnapshot::from_mods([installed("sleepy", "1.0", false)]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let (result, preview) = resolver
            .resolve_with_preview("root", None, &no_overrides())
            .await;
        assert!(result.proceed);
        assert!(preview.starts_with("Dependency Tree:\n"));
        assert!(preview.contains("- first >= 1.2.0\n"));
        assert!(preview.contains("    - nested\n"));
        assert!(preview.contains("- second\n"));
    }

    #[tokio::test]
    async fn test_preview_without_missing_dependencies() {
        let portal = FakePortal::new().with_mod("root", &[("1.0", &["dep"])]);
        let snapshot = ModSnapshot::from_mods([
            installed("root", "0.9", true),
            installed("dep", "1.0", false),
        ]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let (result, preview) = resolver
            .resolve_with_preview("root", Some("1.0"), &no_overrides())
            .await;
        assert!(result.proceed);
        assert!(preview.starts_with("No missing dependencies were found.\n"));
        assert!(preview.contains("Disabled Dependencies to be Enabled:\n- dep Title\n"));
    }

    #[tokio::test]
    async fn test_enable_and_disable_sets_never_overlap() {
        // "both" is a disabled dependency of root and also declared
        // incompatible by a sub-dependency; it must not land in both sets.
        let portal = FakePortal::new()
            .with_mod("root", &[("1.0", &["both", "sub"])])
            .with_mod("sub", &[("1.0", &["! both"])]);
        let snapshot = ModSnapshot::from_mods([installed("both", "1.0", false)]);
        let resolver = DependencyResolver::new(&portal, &snapshot, true);

        let result = resolver.resolve("root", None, &no_overrides()).await;
        assert!(result.proceed);
        let enable: HashSet<_> = result.mods_to_enable.iter().map(|m| m.name.clone()).collect();
        let disable: HashSet<_> = result.mods_to_disable.iter().map(|m| m.name.clone()).collect();
        assert!(enable.is_disjoint(&disable));
        // Disabled mods are not "loaded", so the incompatibility is moot.
        assert!(disable.is_empty());
    }
}
