//! Dependency declaration parsing
//!
//! Factorio mods declare dependencies as plain strings in their release
//! manifests, e.g. `"? optional-mod >= 1.0.0"`, `"! incompatible-mod"`,
//! `"base"`, `"(?) hidden-optional"`. This module parses those strings and
//! classifies the game/DLC pseudo-dependencies that must never be treated
//! as portal-installable mods.

use regex_lite::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

use super::version;

/// Pseudo-dependencies satisfied by the game itself, never by the portal.
pub const GAME_DEPENDENCIES: [&str; 4] = ["base", "space-age", "quality", "elevated-rails"];

/// Subset of [`GAME_DEPENDENCIES`] gated behind the Space Age DLC entitlement.
pub const DLC_DEPENDENCIES: [&str; 3] = ["space-age", "quality", "elevated-rails"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRelation {
    Mandatory,
    Optional,
    Incompatible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOperator {
    None,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl VersionOperator {
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            VersionOperator::None => None,
            VersionOperator::Eq => Some("="),
            VersionOperator::Ge => Some(">="),
            VersionOperator::Gt => Some(">"),
            VersionOperator::Le => Some("<="),
            VersionOperator::Lt => Some("<"),
        }
    }
}

/// One parsed dependency declaration. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDeclaration {
    pub name: String,
    pub relation: DependencyRelation,
    pub operator: VersionOperator,
    pub version: Option<String>,
}

impl DependencyDeclaration {
    /// Display form of the constraint, e.g. ">= 1.2.0", if any.
    pub fn constraint_label(&self) -> Option<String> {
        match (self.operator.symbol(), self.version.as_deref()) {
            (Some(symbol), Some(version)) => Some(format!("{} {}", symbol, version)),
            _ => None,
        }
    }
}

fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // relation marker, name, optional operator + version.
        // `~` is a mandatory dependency that does not affect load order.
        Regex::new(r"^(?:(\(\?\)|!|\?|~)\s*)?([a-zA-Z0-9_\- ]+?)\s*(?:(>=|<=|=|>|<)\s*([0-9][0-9.]*))?$")
            .expect("dependency regex is valid")
    })
}

/// Parse one raw dependency string. Returns `None` for strings that do not
/// match the declaration grammar (malformed portal metadata).
pub fn parse(raw: &str) -> Option<DependencyDeclaration> {
    let caps = declaration_regex().captures(raw.trim())?;

    let relation = match caps.get(1).map(|m| m.as_str()) {
        Some("!") => DependencyRelation::Incompatible,
        Some("?") => DependencyRelation::Optional,
        Some("(?)") => DependencyRelation::Hidden,
        Some("~") | None => DependencyRelation::Mandatory,
        Some(_) => return None,
    };

    let name = caps.get(2)?.as_str().trim().to_string();
    if name.is_empty() {
        return None;
    }

    let operator = match caps.get(3).map(|m| m.as_str()) {
        None => VersionOperator::None,
        Some("=") => VersionOperator::Eq,
        Some(">=") => VersionOperator::Ge,
        Some(">") => VersionOperator::Gt,
        Some("<=") => VersionOperator::Le,
        Some("<") => VersionOperator::Lt,
        Some(_) => return None,
    };

    let version = caps.get(4).map(|m| m.as_str().to_string());

    Some(DependencyDeclaration {
        name,
        relation,
        operator,
        version,
    })
}

/// Parse a release's dependency list and keep only the mandatory entries,
/// with their version constraints, in manifest order.
pub fn mandatory_dependencies(list: &[String]) -> Vec<DependencyDeclaration> {
    list.iter()
        .filter_map(|raw| parse(raw))
        .filter(|dep| dep.relation == DependencyRelation::Mandatory)
        .collect()
}

/// Names declared incompatible (`!`) in a release's dependency list.
pub fn incompatible_names(list: &[String]) -> Vec<String> {
    list.iter()
        .filter_map(|raw| parse(raw))
        .filter(|dep| dep.relation == DependencyRelation::Incompatible)
        .map(|dep| dep.name)
        .collect()
}

/// True for dependencies on the base game or a DLC.
pub fn is_game_dependency(name: &str) -> bool {
    GAME_DEPENDENCIES
        .iter()
        .any(|game| game.eq_ignore_ascii_case(name))
}

/// True for dependencies that require the Space Age DLC entitlement.
pub fn is_dlc_dependency(name: &str) -> bool {
    DLC_DEPENDENCIES
        .iter()
        .any(|dlc| dlc.eq_ignore_ascii_case(name))
}

/// Check an installed (or planned) version against a declared constraint.
///
/// No operator means anything satisfies; no installed version never
/// satisfies a real constraint. A comparison that cannot be determined
/// (malformed version string) counts as unsatisfied.
pub fn satisfies_constraint(
    installed: Option<&str>,
    operator: VersionOperator,
    required: Option<&str>,
) -> bool {
    if operator == VersionOperator::None {
        return true;
    }
    let (Some(installed), Some(required)) = (installed, required) else {
        return false;
    };

    let ordering = match version::compare(installed, required) {
        Ok(ordering) => ordering,
        Err(e) => {
            tracing::debug!("Cannot evaluate version constraint: {}", e);
            return false;
        }
    };

    match operator {
        VersionOperator::None => true,
        VersionOperator::Eq => ordering == Ordering::Equal,
        VersionOperator::Ge => ordering != Ordering::Less,
        VersionOperator::Gt => ordering == Ordering::Greater,
        VersionOperator::Le => ordering != Ordering::Greater,
        VersionOperator::Lt => ordering == Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_mandatory() {
        let dep = parse("base").unwrap();
        assert_eq!(dep.name, "base");
        assert_eq!(dep.relation, DependencyRelation::Mandatory);
        assert_eq!(dep.operator, VersionOperator::None);
        assert_eq!(dep.version, None);
    }

    #[test]
    fn test_parse_markers() {
        assert_eq!(
            parse("! incompatible-mod").unwrap().relation,
            DependencyRelation::Incompatible
        );
        assert_eq!(
            parse("? optional-mod >= 1.0.0").unwrap().relation,
            DependencyRelation::Optional
        );
        assert_eq!(
            parse("(?) hidden-optional").unwrap().relation,
            DependencyRelation::Hidden
        );
        // Load-order-neutral marker is still a hard requirement
        assert_eq!(
            parse("~ helper-lib").unwrap().relation,
            DependencyRelation::Mandatory
        );
    }

    #[test]
    fn test_parse_constraint() {
        let dep = parse("flib >= 0.12.0").unwrap();
        assert_eq!(dep.name, "flib");
        assert_eq!(dep.operator, VersionOperator::Ge);
        assert_eq!(dep.version.as_deref(), Some("0.12.0"));
        assert_eq!(dep.constraint_label().as_deref(), Some(">= 0.12.0"));

        let dep = parse("exact-mod = 2.1").unwrap();
        assert_eq!(dep.operator, VersionOperator::Eq);
    }

    #[test]
    fn test_parse_name_with_spaces() {
        let dep = parse("Squeak Through < 2.0").unwrap();
        assert_eq!(dep.name, "Squeak Through");
        assert_eq!(dep.operator, VersionOperator::Lt);
    }

    #[test]
    fn test_mandatory_filter_keeps_manifest_order() {
        let list = vec![
            "base".to_string(),
            "? optional-thing".to_string(),
            "zz-late-lib >= 1.0".to_string(),
            "! conflicting".to_string(),
            "aa-early-lib".to_string(),
        ];
        let mandatory = mandatory_dependencies(&list);
        let names: Vec<_> = mandatory.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["base", "zz-late-lib", "aa-early-lib"]);

        assert_eq!(incompatible_names(&list), vec!["conflicting".to_string()]);
    }

    #[test]
    fn test_game_and_dlc_classification() {
        assert!(is_game_dependency("base"));
        assert!(is_game_dependency("space-age"));
        assert!(is_game_dependency("quality"));
        assert!(is_game_dependency("elevated-rails"));
        assert!(!is_game_dependency("flib"));

        assert!(!is_dlc_dependency("base"));
        assert!(is_dlc_dependency("space-age"));
        assert!(is_dlc_dependency("elevated-rails"));
    }

    #[test]
    fn test_satisfies_constraint() {
        use VersionOperator::*;
        assert!(satisfies_constraint(Option::None, VersionOperator::None, Option::None));
        assert!(satisfies_constraint(Some("1.0"), Ge, Some("1.0.0")));
        assert!(satisfies_constraint(Some("1.1"), Gt, Some("1.0")));
        assert!(!satisfies_constraint(Some("1.0"), Gt, Some("1.0")));
        assert!(satisfies_constraint(Some("1.0"), Le, Some("1.0")));
        assert!(satisfies_constraint(Some("0.9"), Lt, Some("1.0")));
        assert!(satisfies_constraint(Some("2.0.0"), Eq, Some("2.0")));
        // Absent installed version never satisfies a real constraint
        assert!(!satisfies_constraint(Option::None, Ge, Some("1.0")));
        // Undeterminable comparison is unsatisfied, not satisfied
        assert!(!satisfies_constraint(Some("weird"), Ge, Some("1.0")));
    }
}
