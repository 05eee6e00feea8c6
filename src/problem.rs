//! Structured resolution outcomes.
//!
//! A [`Resolution`] carries everything a caller needs to explain a result:
//! the merge list (when one could be computed), every [`Problem`] found by
//! the reported attempt, and the configuration changes ([`Suggestion`]s)
//! that would let the plan proceed.

use std::collections::BTreeMap;
use std::fmt;

use crate::atom::Dep;
use crate::error::{AtomError, DepStringError, GraphError};
use crate::graph::DependencyGraph;
use crate::merge_order::MergeList;
use crate::package::{CandidateKey, DepClass, Package, SlotKey};

/// A reason a resolution attempt could not produce a valid plan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Problem {
    /// Nothing satisfies a dependency.
    #[error("no package satisfies '{atom}'{}{}", required_by(.parent), masked_note(.masked))]
    UnsatisfiableDependency {
        /// The unsatisfied atom.
        atom: Dep,
        /// The package declaring it; `None` for root atoms.
        parent: Option<Package>,
        /// Candidates that matched but were masked, with the reason.
        masked: Vec<(CandidateKey, String)>,
    },
    /// Several packages were selected into one slot.
    #[error("slot conflict in {slot}: {}", join(.packages))]
    SlotConflict {
        /// The contested slot.
        slot: SlotKey,
        /// The competing packages.
        packages: Vec<Package>,
    },
    /// A blocker matches a package the plan needs.
    #[error("{parent} blocks {} via '{blocker}'", join(.blocked))]
    BlockerConflict {
        /// The blocker atom.
        blocker: Dep,
        /// The package declaring the blocker.
        parent: Package,
        /// Packages it conflicts with.
        blocked: Vec<Package>,
    },
    /// A cycle of hard dependencies.
    #[error("circular dependency: {}", .cycle.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" -> "))]
    CircularDependency {
        /// Packages of the cycle, in edge order.
        cycle: Vec<Package>,
        /// USE changes that would drop an edge of the cycle.
        suggestions: Vec<Suggestion>,
    },
    /// REQUIRED_USE does not hold for the selected USE flags.
    #[error("REQUIRED_USE of {package} not satisfied: {}", .clauses.join(", "))]
    RequiredUseUnsatisfied {
        /// The package.
        package: Package,
        /// The full REQUIRED_USE string.
        required_use: String,
        /// Clauses that fail.
        clauses: Vec<String>,
    },
    /// A dependency string of a package could not be parsed.
    #[error("invalid {class} of {package}: {error}")]
    InvalidDependString {
        /// The package.
        package: Package,
        /// The offending dependency class.
        class: DepClass,
        /// The parser error.
        error: DepStringError,
    },
    /// The REQUIRED_USE string of a package could not be parsed.
    #[error("invalid REQUIRED_USE of {package}: {error}")]
    InvalidRequiredUse {
        /// The package.
        package: Package,
        /// The parser error.
        error: DepStringError,
    },
    /// A root atom could not be parsed.
    #[error("invalid atom '{atom}': {error}")]
    InvalidAtom {
        /// The raw argument.
        atom: String,
        /// The parser error.
        error: AtomError,
    },
    /// Nothing provides a shared library a package links against.
    #[error("{package} requires {soname}, which nothing provides")]
    UnsatisfiedSoname {
        /// The package.
        package: Package,
        /// The missing soname.
        soname: String,
    },
    /// The graph was built inconsistently.
    #[error("internal error: {error}")]
    Internal {
        /// The violated invariant.
        error: GraphError,
    },
}

fn required_by(parent: &Option<Package>) -> String {
    parent
        .as_ref()
        .map(|p| format!(" (required by {p})"))
        .unwrap_or_default()
}

fn masked_note(masked: &[(CandidateKey, String)]) -> String {
    if masked.is_empty() {
        return String::new();
    }
    let list: Vec<String> = masked.iter().map(|(k, why)| format!("{k}: {why}")).collect();
    format!("; masked: {}", list.join(", "))
}

fn join(packages: &[Package]) -> String {
    packages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A configuration change that would let resolution proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suggestion {
    /// Flip USE flags of a package (`flag -> new state`).
    UseChange {
        /// The package.
        package: CandidateKey,
        /// Flags and the state they need.
        changes: BTreeMap<String, bool>,
    },
    /// Accept an unstable keyword for a package.
    AcceptKeyword {
        /// The package.
        package: CandidateKey,
        /// The keyword to accept.
        keyword: String,
    },
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suggestion::UseChange { package, changes } => {
                write!(f, "={}-{}", package.cpn, package.version)?;
                for (flag, on) in changes {
                    let sign = if *on { "" } else { "-" };
                    write!(f, " {sign}{flag}")?;
                }
                Ok(())
            }
            Suggestion::AcceptKeyword { package, keyword } => {
                write!(f, "={}-{} {keyword}", package.cpn, package.version)
            }
        }
    }
}

/// The result of [`Resolver::resolve`](crate::Resolver::resolve).
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// The ordered plan, when the reported attempt got that far.
    pub merge_list: Option<MergeList>,
    /// Problems of the reported attempt.
    pub problems: Vec<Problem>,
    /// Configuration changes the plan depends on.
    pub suggestions: Vec<Suggestion>,
    /// The dependency graph of the reported attempt.
    pub graph: DependencyGraph<Package>,
    /// Attempts made, including the reported one.
    pub attempts: usize,
}

impl Resolution {
    /// A plan exists and needs no configuration changes.
    pub fn is_success(&self) -> bool {
        self.merge_list.is_some() && self.problems.is_empty() && self.suggestions.is_empty()
    }

    /// A plan exists only once the suggestions are applied.
    pub fn needs_config_changes(&self) -> bool {
        !self.suggestions.is_empty()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(list) = &self.merge_list {
            for step in &list.steps {
                writeln!(f, "[{:>9}] {}", step.change.to_string(), step.package.describe())?;
            }
            if !list.runtime_cycles.is_empty() {
                writeln!(f, "packages merged as a group (runtime cycle):")?;
                for group in &list.runtime_cycles {
                    writeln!(f, "  {}", join(group))?;
                }
            }
            for b in list.cycle_breaks.iter().filter(|b| b.hard) {
                writeln!(f, "warning: {} was merged before its dependency {}", b.parent, b.child)?;
            }
        }
        for problem in &self.problems {
            writeln!(f, "error: {problem}")?;
            if let Problem::CircularDependency { suggestions, .. } = problem {
                for s in suggestions {
                    writeln!(f, "  possible fix: {s}")?;
                }
            }
        }
        if !self.suggestions.is_empty() {
            writeln!(f, "the following configuration changes are necessary:")?;
            for s in &self.suggestions {
                writeln!(f, "  {s}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use portage_atom::{Cpn, Cpv, Version};

    use super::*;
    use crate::atom::parse_atom;
    use crate::package::{Operation, PackageMetadata, Provenance};

    fn pkg(cpv: &str) -> Package {
        let meta = PackageMetadata::new(Cpv::parse(cpv).unwrap());
        Package::new(Arc::new(meta), Provenance::Ebuild, Operation::Merge, BTreeSet::new())
    }

    fn key(cpv: &str) -> CandidateKey {
        pkg(cpv).candidate_key()
    }

    #[test]
    fn unsatisfiable_message_names_parent_and_masks() {
        let p = Problem::UnsatisfiableDependency {
            atom: parse_atom(">=dev-libs/foo-2").unwrap(),
            parent: Some(pkg("app-misc/bar-1")),
            masked: vec![(key("dev-libs/foo-2"), "missing keyword (~amd64)".into())],
        };
        let msg = p.to_string();
        assert!(msg.starts_with("no package satisfies '>=dev-libs/foo-2' (required by app-misc/bar-1)"));
        assert!(msg.contains("missing keyword (~amd64)"));
    }

    #[test]
    fn slot_conflict_lists_packages() {
        let p = Problem::SlotConflict {
            slot: SlotKey {
                cpn: Cpn::new("dev-libs", "foo"),
                slot: "0".into(),
            },
            packages: vec![pkg("dev-libs/foo-1"), pkg("dev-libs/foo-2")],
        };
        assert_eq!(p.to_string(), "slot conflict in dev-libs/foo:0: dev-libs/foo-1, dev-libs/foo-2");
    }

    #[test]
    fn suggestion_formats_like_package_use() {
        let mut changes = BTreeMap::new();
        changes.insert("ssl".to_string(), true);
        changes.insert("gtk".to_string(), false);
        let s = Suggestion::UseChange {
            package: key("net-misc/curl-8.5.0"),
            changes,
        };
        assert_eq!(s.to_string(), "=net-misc/curl-8.5.0 -gtk ssl");

        let k = Suggestion::AcceptKeyword {
            package: CandidateKey {
                cpn: Cpn::new("dev-libs", "foo"),
                version: Version::parse("2").unwrap(),
                repo: None,
                provenance: Provenance::Ebuild,
            },
            keyword: "~amd64".into(),
        };
        assert_eq!(k.to_string(), "=dev-libs/foo-2 ~amd64");
    }

    #[test]
    fn success_requires_plan_without_changes() {
        let mut r = Resolution::default();
        assert!(!r.is_success());
        r.merge_list = Some(MergeList::default());
        assert!(r.is_success());
        r.suggestions.push(Suggestion::AcceptKeyword {
            package: key("dev-libs/foo-2"),
            keyword: "~amd64".into(),
        });
        assert!(!r.is_success());
        assert!(r.needs_config_changes());
    }
}
