//! The fixed verification checklist.
//!
//! Each check compares what a worker reports it did (`ArtifactManifest`)
//! against what the unit declared (`UnitSpec`, scopes, role). Artifact
//! content itself is never inspected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ownership::normalize_scope;
use crate::unit::{ArtifactRef, WorkUnit};

/// What a worker says its artifact exports and does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Exported symbols
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Side effects performed
    #[serde(default)]
    pub side_effects: Vec<String>,
    /// Paths written
    #[serde(default)]
    pub paths: Vec<String>,
    /// Error kinds the artifact can raise
    #[serde(default)]
    pub error_kinds: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Interface,
    SideEffects,
    ResourceScope,
    ErrorTaxonomy,
    RoleCapability,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Interface => "interface",
            Self::SideEffects => "side_effects",
            Self::ResourceScope => "resource_scope",
            Self::ErrorTaxonomy => "error_taxonomy",
            Self::RoleCapability => "role_capability",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub passed: bool,
    #[serde(default)]
    pub findings: Vec<String>,
}

impl CheckResult {
    fn from_findings(check: CheckKind, findings: Vec<String>) -> Self {
        Self {
            check,
            passed: findings.is_empty(),
            findings,
        }
    }
}

/// Every symbol the unit promises is exported.
pub fn check_interface(unit: &WorkUnit, manifest: &ArtifactManifest) -> CheckResult {
    let findings = unit
        .spec
        .interface
        .iter()
        .filter(|sym| !manifest.symbols.contains(sym))
        .map(|sym| format!("missing exported symbol `{}`", sym))
        .collect();
    CheckResult::from_findings(CheckKind::Interface, findings)
}

/// No side effect outside the declared set.
pub fn check_side_effects(unit: &WorkUnit, manifest: &ArtifactManifest) -> CheckResult {
    let findings = manifest
        .side_effects
        .iter()
        .filter(|e| !unit.spec.side_effects.contains(e))
        .map(|e| format!("undeclared side effect `{}`", e))
        .collect();
    CheckResult::from_findings(CheckKind::SideEffects, findings)
}

fn within(path: &str, scope: &str) -> bool {
    path == scope
        || (path.len() > scope.len()
            && path.starts_with(scope)
            && path.as_bytes()[scope.len()] == b'/')
}

/// Every written path lies inside one of the unit's scopes, and only roles
/// allowed to write touched anything at all.
pub fn check_resource_scope(unit: &WorkUnit, manifest: &ArtifactManifest) -> CheckResult {
    let mut findings = Vec::new();
    if !manifest.paths.is_empty() && !unit.role.capability().may_write {
        findings.push(format!(
            "role {} may not write, but touched {} path(s)",
            unit.role,
            manifest.paths.len()
        ));
    }
    let scopes: Vec<String> = unit.scopes.iter().map(|s| normalize_scope(s)).collect();
    for path in &manifest.paths {
        let path = normalize_scope(path);
        if !scopes.iter().any(|s| within(&path, s)) {
            findings.push(format!("path `{}` is outside the unit's scopes", path));
        }
    }
    CheckResult::from_findings(CheckKind::ResourceScope, findings)
}

/// Every raised error kind belongs to the declared taxonomy.
pub fn check_error_taxonomy(unit: &WorkUnit, manifest: &ArtifactManifest) -> CheckResult {
    let findings = manifest
        .error_kinds
        .iter()
        .filter(|k| !unit.spec.error_kinds.contains(k))
        .map(|k| format!("error kind `{}` is not in the declared taxonomy", k))
        .collect();
    CheckResult::from_findings(CheckKind::ErrorTaxonomy, findings)
}

/// Roles that must produce an artifact did.
pub fn check_role_capability(unit: &WorkUnit, artifacts: &[ArtifactRef]) -> CheckResult {
    let mut findings = Vec::new();
    if unit.role.capability().requires_artifact && artifacts.is_empty() {
        findings.push(format!("role {} returned no artifact", unit.role));
    }
    CheckResult::from_findings(CheckKind::RoleCapability, findings)
}

/// Run the whole checklist in a fixed order.
pub fn run_all(
    unit: &WorkUnit,
    manifest: &ArtifactManifest,
    artifacts: &[ArtifactRef],
) -> Vec<CheckResult> {
    vec![
        check_interface(unit, manifest),
        check_side_effects(unit, manifest),
        check_resource_scope(unit, manifest),
        check_error_taxonomy(unit, manifest),
        check_role_capability(unit, artifacts),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{UnitSpec, WorkerRole};

    fn coder() -> WorkUnit {
        WorkUnit::new("A", "auth", vec![])
            .with_scopes(vec!["modules/auth".into()])
            .with_spec(UnitSpec {
                interface: vec!["login".into(), "logout".into()],
                side_effects: vec!["fs_write".into()],
                error_kinds: vec!["AuthError".into()],
                consults: vec![],
            })
    }

    #[test]
    fn test_interface_reports_each_missing_symbol() {
        let manifest = ArtifactManifest {
            symbols: vec!["login".into()],
            ..Default::default()
        };
        let r = check_interface(&coder(), &manifest);
        assert!(!r.passed);
        assert_eq!(r.findings, vec!["missing exported symbol `logout`"]);
    }

    #[test]
    fn test_side_effects_outside_declaration() {
        let manifest = ArtifactManifest {
            side_effects: vec!["fs_write".into(), "network".into()],
            ..Default::default()
        };
        let r = check_side_effects(&coder(), &manifest);
        assert_eq!(r.findings.len(), 1);
        assert!(r.findings[0].contains("network"));
    }

    #[test]
    fn test_resource_scope_respects_segments() {
        let manifest = ArtifactManifest {
            paths: vec![
                "modules/auth/login.rs".into(),
                "modules/authz/policy.rs".into(),
            ],
            ..Default::default()
        };
        let r = check_resource_scope(&coder(), &manifest);
        assert_eq!(r.findings.len(), 1);
        assert!(r.findings[0].contains("modules/authz/policy.rs"));
    }

    #[test]
    fn test_read_only_role_may_not_write() {
        let unit = coder().with_role(WorkerRole::Scout);
        let manifest = ArtifactManifest {
            paths: vec!["modules/auth/notes.md".into()],
            ..Default::default()
        };
        let r = check_resource_scope(&unit, &manifest);
        assert!(!r.passed);
        assert!(r.findings[0].contains("may not write"));
    }

    #[test]
    fn test_error_taxonomy() {
        let manifest = ArtifactManifest {
            error_kinds: vec!["AuthError".into(), "Panic".into()],
            ..Default::default()
        };
        let r = check_error_taxonomy(&coder(), &manifest);
        assert_eq!(r.findings, vec!["error kind `Panic` is not in the declared taxonomy"]);
    }

    #[test]
    fn test_role_capability_requires_artifact() {
        assert!(!check_role_capability(&coder(), &[]).passed);
        assert!(check_role_capability(&coder(), &["commit:abc".into()]).passed);
        let scout = coder().with_role(WorkerRole::Scout);
        assert!(check_role_capability(&scout, &[]).passed);
    }

    #[test]
    fn test_run_all_order() {
        let checks = run_all(&coder(), &ArtifactManifest::default(), &[]);
        let kinds: Vec<CheckKind> = checks.iter().map(|c| c.check).collect();
        assert_eq!(
            kinds,
            vec![
                CheckKind::Interface,
                CheckKind::SideEffects,
                CheckKind::ResourceScope,
                CheckKind::ErrorTaxonomy,
                CheckKind::RoleCapability,
            ]
        );
    }
}
