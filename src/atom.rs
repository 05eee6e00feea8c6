//! Dependency atoms.
//!
//! Atoms are [`portage_atom::Dep`] values:
//!
//! ```text
//! [!|!!][op]category/package[-version[*]][:slot[/subslot][=]|:*|:=][use,deps][::repo]
//! ```
//!
//! [`parse_atom`] adds the checks the resolver relies on (a version always
//! carries an operator, `*` only follows `=`), and [`DepExt`] adds the
//! matching helpers: slot extraction, version matching under
//! [`compare_versions`](crate::version::compare_versions), and the
//! specificity used to order configuration overrides.

pub use portage_atom::{Blocker, Dep, Slot, SlotDep, SlotOperator, UseDefault, UseDep, UseDepKind};

use portage_atom::{Operator, Version};

use crate::error::AtomError;
use crate::version::version_matches;

/// Parse an atom string.
pub fn parse_atom(input: &str) -> Result<Dep, AtomError> {
    let dep = Dep::parse(input.trim())?;
    checked(dep)
}

/// Reject operator-less versions and globs on anything but `=`.
///
/// `Dep::parse` accepts both; PMS does not.
pub(crate) fn checked(dep: Dep) -> Result<Dep, AtomError> {
    if let Some(version) = &dep.version {
        match version.op {
            None => return Err(AtomError::MissingOperator(dep.to_string())),
            Some(op) if version.glob && op != Operator::Equal => {
                return Err(AtomError::MisplacedGlob(dep.to_string()));
            }
            Some(_) => {}
        }
    }
    Ok(dep)
}

/// Matching helpers on top of [`Dep`].
pub trait DepExt {
    /// True for `!atom` and `!!atom`.
    fn is_blocker(&self) -> bool;

    /// The same atom without its blocker prefix.
    fn without_blocker(&self) -> Dep;

    /// Named slot, if any.
    fn slot(&self) -> Option<&str>;

    /// Named sub-slot, if any.
    fn subslot(&self) -> Option<&str>;

    /// True for `:=` and `:slot=` atoms.
    fn has_slot_equal_op(&self) -> bool;

    /// The `[...]` list, empty when absent.
    fn use_dep_list(&self) -> &[UseDep];

    /// Check only the version part of the atom.
    fn matches_version(&self, candidate: &Version) -> bool;

    /// How specific the atom is, used to order configuration overrides.
    ///
    /// Exact versions rank highest, then `~`, then `=*` globs, then
    /// slot-only atoms, then ranges, then bare names.
    fn specificity(&self) -> u8;
}

impl DepExt for Dep {
    fn is_blocker(&self) -> bool {
        self.blocker.is_some()
    }

    fn without_blocker(&self) -> Dep {
        Dep {
            blocker: None,
            ..self.clone()
        }
    }

    fn slot(&self) -> Option<&str> {
        match &self.slot_dep {
            Some(SlotDep::Slot { slot: Some(s), .. }) => Some(&s.slot),
            _ => None,
        }
    }

    fn subslot(&self) -> Option<&str> {
        match &self.slot_dep {
            Some(SlotDep::Slot { slot: Some(s), .. }) => s.subslot.as_deref(),
            _ => None,
        }
    }

    fn has_slot_equal_op(&self) -> bool {
        matches!(
            self.slot_dep,
            Some(SlotDep::Operator(SlotOperator::Equal))
                | Some(SlotDep::Slot {
                    op: Some(SlotOperator::Equal),
                    ..
                })
        )
    }

    fn use_dep_list(&self) -> &[UseDep] {
        self.use_deps.as_deref().unwrap_or(&[])
    }

    fn matches_version(&self, candidate: &Version) -> bool {
        let Some(constraint) = &self.version else {
            return true;
        };
        match &constraint.op {
            Some(op) => version_matches(candidate, op, constraint),
            None => true,
        }
    }

    fn specificity(&self) -> u8 {
        let Some(version) = &self.version else {
            return if self.slot().is_some() { 3 } else { 1 };
        };
        match version.op {
            Some(Operator::Equal) if !version.glob => 6,
            Some(Operator::Approximate) => 5,
            Some(Operator::Equal) => 4,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portage_atom::Cpn;

    fn atom(s: &str) -> Dep {
        parse_atom(s).unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parse_bare_atom() {
        let a = atom("dev-lang/rust");
        assert_eq!(a.cpn, Cpn::new("dev-lang", "rust"));
        assert!(a.version.is_none());
        assert!(a.slot_dep.is_none());
        assert!(a.use_dep_list().is_empty());
        assert!(!a.is_blocker());
    }

    #[test]
    fn versioned_atom_matches_range() {
        let a = atom(">=dev-libs/b-1.5:0=");
        assert_eq!(a.version.as_ref().and_then(|v| v.op), Some(Operator::GreaterOrEqual));
        assert!(a.matches_version(&v("1.5")));
        assert!(a.matches_version(&v("2.0")));
        assert!(!a.matches_version(&v("1.4.9")));
        assert_eq!(a.slot(), Some("0"));
        assert!(a.has_slot_equal_op());
    }

    #[test]
    fn approximate_ignores_revision() {
        let a = atom("~dev-libs/a-1");
        assert!(a.matches_version(&v("1-r3")));
        assert!(!a.matches_version(&v("1.0.1")));
    }

    #[test]
    fn blockers() {
        let a = atom("!!dev-libs/d:2");
        assert_eq!(a.blocker, Some(Blocker::Strong));
        assert_eq!(a.slot(), Some("2"));
        assert_eq!(atom("!dev-libs/d").blocker, Some(Blocker::Weak));
        assert_eq!(a.without_blocker(), atom("dev-libs/d:2"));
    }

    #[test]
    fn slot_forms() {
        let a = atom("dev-libs/openssl:0/1.1");
        assert_eq!(a.slot(), Some("0"));
        assert_eq!(a.subslot(), Some("1.1"));
        assert!(!a.has_slot_equal_op());

        let a = atom("dev-libs/openssl:=");
        assert_eq!(a.slot(), None);
        assert!(a.has_slot_equal_op());

        let a = atom("dev-lang/python:*");
        assert_eq!(a.slot_dep, Some(SlotDep::Operator(SlotOperator::Star)));
        assert!(!a.has_slot_equal_op());
    }

    #[test]
    fn use_dependency_kinds() {
        let a = atom("net-misc/curl[ssl(+),-gtk,doc?,!x=]");
        let kinds: Vec<UseDepKind> = a.use_dep_list().iter().map(|u| u.kind).collect();
        assert_eq!(
            kinds,
            vec![
                UseDepKind::Enabled,
                UseDepKind::Disabled,
                UseDepKind::Conditional,
                UseDepKind::EqualInverse,
            ]
        );
        assert_eq!(a.use_dep_list()[0].default, Some(UseDefault::Enabled));
    }

    #[test]
    fn repository_constraint() {
        let a = atom("dev-libs/foo::gentoo");
        assert_eq!(a.repo.as_deref(), Some("gentoo"));
        assert_eq!(a.to_string(), "dev-libs/foo::gentoo");
    }

    #[test]
    fn glob_matches_prefix() {
        let a = atom("=dev-lang/python-3.12*");
        assert!(a.matches_version(&v("3.12.4")));
        assert!(!a.matches_version(&v("3.13.0")));
    }

    #[test]
    fn revision_zero_is_normalized() {
        assert_eq!(atom("=dev-libs/foo-1.0-r0"), atom("=dev-libs/foo-1.0"));
    }

    #[test]
    fn malformed_atoms_are_rejected() {
        for s in [
            "",
            "dev-libs",
            ">=dev-libs/foo",
            "dev-libs/foo-1.0",
            ">=dev-libs/foo-1*",
            "dev-libs/foo[",
            "dev-libs/foo[ssl,]",
            "dev-libs/foo:",
            "dev-libs/foo::",
        ] {
            assert!(parse_atom(s).is_err(), "{s} should not parse");
        }
        assert!(matches!(
            parse_atom("dev-libs/foo-1.0"),
            Err(AtomError::MissingOperator(_))
        ));
    }

    #[test]
    fn specificity_ranking() {
        let ordered = [
            "dev-libs/foo",
            ">=dev-libs/foo-1",
            "dev-libs/foo:1",
            "=dev-libs/foo-1*",
            "~dev-libs/foo-1",
            "=dev-libs/foo-1",
        ];
        let ranks: Vec<u8> = ordered.iter().map(|s| atom(s).specificity()).collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);
    }
}
