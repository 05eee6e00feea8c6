//! Matching atoms against concrete packages.
//!
//! All functions here are pure: they never reorder beyond what is documented
//! and return the same answer for the same inputs.

use crate::atom::{Dep, DepExt, UseDefault, UseDepKind};
use crate::package::{Package, Provenance};
use crate::version::compare_versions;

/// A USE state an atom requires of a candidate but does not get.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UseRequirement {
    /// Flag name.
    pub flag: String,
    /// State the atom requires.
    pub enabled: bool,
    /// Whether the candidate could be rebuilt with that state: the flag is
    /// in IUSE and the candidate is built from source.
    pub changeable: bool,
}

/// Match name, version, slot, sub-slot and repository; ignore USE and the
/// blocker prefix.
pub fn atom_matches_ignoring_use(atom: &Dep, pkg: &Package) -> bool {
    if atom.cpn != *pkg.cpn() {
        return false;
    }
    if !atom.matches_version(pkg.version()) {
        return false;
    }
    if atom.slot().is_some_and(|s| s != pkg.slot()) {
        return false;
    }
    if atom.subslot().is_some_and(|s| s != pkg.subslot()) {
        return false;
    }
    if let Some(repo) = &atom.repo {
        if pkg.repo() != Some(repo.as_str()) {
            return false;
        }
    }
    true
}

/// USE dependencies of `atom` that `pkg` fails, evaluated against the
/// parent's USE for the conditional forms.
///
/// Root atoms have no parent; conditional forms then see every parent flag
/// as disabled.
pub fn use_mismatches(atom: &Dep, pkg: &Package, parent: Option<&Package>) -> Vec<UseRequirement> {
    let mut out = Vec::new();
    for dep in atom.use_dep_list() {
        let parent_on = parent.is_some_and(|p| p.is_enabled(&dep.flag));
        let required = match dep.kind {
            UseDepKind::Enabled => Some(true),
            UseDepKind::Disabled => Some(false),
            UseDepKind::Equal => Some(parent_on),
            UseDepKind::EqualInverse => Some(!parent_on),
            UseDepKind::Conditional => parent_on.then_some(true),
            UseDepKind::ConditionalInverse => (!parent_on).then_some(false),
        };
        let Some(required) = required else {
            continue;
        };
        let has_iuse = pkg.metadata().has_iuse(&dep.flag);
        let actual = if has_iuse {
            Some(pkg.is_enabled(&dep.flag))
        } else {
            match dep.default {
                Some(UseDefault::Enabled) => Some(true),
                Some(UseDefault::Disabled) => Some(false),
                None => None,
            }
        };
        if actual != Some(required) {
            out.push(UseRequirement {
                flag: dep.flag.clone(),
                enabled: required,
                changeable: has_iuse && pkg.provenance() == Provenance::Ebuild,
            });
        }
    }
    out
}

/// Full match of a non-blocker atom against one package.
pub fn atom_matches(atom: &Dep, pkg: &Package, parent: Option<&Package>) -> bool {
    atom_matches_ignoring_use(atom, pkg) && use_mismatches(atom, pkg, parent).is_empty()
}

/// Candidates satisfying `atom`, in their input order.
///
/// Blocker atoms never match for installation purposes; use
/// [`blocked_packages`] to find what they conflict with.
pub fn filter_candidates(atom: &Dep, candidates: &[Package], parent: Option<&Package>) -> Vec<Package> {
    if atom.is_blocker() {
        return Vec::new();
    }
    candidates
        .iter()
        .filter(|pkg| atom_matches(atom, pkg, parent))
        .cloned()
        .collect()
}

/// Candidates satisfying `atom`, ascending by version (stable for equal
/// versions).
pub fn match_candidates(atom: &Dep, candidates: &[Package], parent: Option<&Package>) -> Vec<Package> {
    let mut out = filter_candidates(atom, candidates, parent);
    out.sort_by(|a, b| compare_versions(a.version(), b.version()));
    out
}

/// Packages a blocker atom conflicts with.
///
/// The blocker's owner never blocks itself.
pub fn blocked_packages(blocker: &Dep, candidates: &[Package], owner: Option<&Package>) -> Vec<Package> {
    if !blocker.is_blocker() {
        return Vec::new();
    }
    let target = blocker.without_blocker();
    candidates
        .iter()
        .filter(|pkg| owner.is_none_or(|o| o.cpv() != pkg.cpv()))
        .filter(|pkg| atom_matches(&target, pkg, owner))
        .cloned()
        .collect()
}

/// Values of every atom in `entries` that matches `pkg`, least specific
/// first, so that applying them in order lets the most specific entry win.
///
/// Entries of equal specificity keep their input order.
pub fn ordered_by_atom_specificity<'a, V>(entries: &'a [(Dep, V)], pkg: &Package) -> Vec<&'a V> {
    let mut hits: Vec<(u8, usize, &V)> = entries
        .iter()
        .enumerate()
        .filter(|(_, (atom, _))| !atom.is_blocker() && atom_matches(atom, pkg, None))
        .map(|(i, (atom, value))| (atom.specificity(), i, value))
        .collect();
    hits.sort_by_key(|(rank, i, _)| (*rank, *i));
    hits.into_iter().map(|(_, _, v)| v).collect()
}
