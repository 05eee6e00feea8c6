//! Bookkeeping of what a resolution attempt has selected.
//!
//! The tracker answers "what would be on the system if the plan ran now":
//! selected packages (to be merged or kept), plus installed packages that
//! nothing replaces and nothing removes.

use indexmap::{IndexMap, IndexSet};

use crate::atom::Dep;
use crate::matcher::atom_matches;
use crate::package::{CandidateKey, Package, SlotKey};

/// Selected and installed packages, per slot.
#[derive(Debug, Clone, Default)]
pub struct PackageTracker {
    installed: IndexMap<SlotKey, Package>,
    selected: IndexMap<SlotKey, Vec<Package>>,
    removing: IndexSet<CandidateKey>,
}

impl PackageTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an installed package.
    pub fn add_installed(&mut self, pkg: Package) {
        self.installed.insert(pkg.slot_key(), pkg);
    }

    /// Record a selection; returns `false` if it was already selected.
    pub fn select(&mut self, pkg: Package) -> bool {
        let slot = self.selected.entry(pkg.slot_key()).or_default();
        if slot.contains(&pkg) {
            return false;
        }
        slot.push(pkg);
        true
    }

    /// Drop a selection.
    pub fn deselect(&mut self, pkg: &Package) {
        if let Some(slot) = self.selected.get_mut(&pkg.slot_key()) {
            slot.retain(|p| p != pkg);
            if slot.is_empty() {
                self.selected.shift_remove(&pkg.slot_key());
            }
        }
    }

    /// Schedule an installed package for removal.
    pub fn remove_installed(&mut self, pkg: &Package) {
        self.removing.insert(pkg.candidate_key());
    }

    /// Whether an installed package is scheduled for removal.
    pub fn is_removing(&self, pkg: &Package) -> bool {
        self.removing.contains(&pkg.candidate_key())
    }

    /// The installed package occupying a slot.
    pub fn installed_in(&self, key: &SlotKey) -> Option<&Package> {
        self.installed.get(key)
    }

    /// Packages selected into a slot.
    pub fn selected_in(&self, key: &SlotKey) -> &[Package] {
        self.selected.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// All installed packages.
    pub fn installed(&self) -> impl Iterator<Item = &Package> {
        self.installed.values()
    }

    /// All selected packages, in selection order by slot.
    pub fn selected(&self) -> impl Iterator<Item = &Package> {
        self.selected.values().flatten()
    }

    /// An installed package is covered when a merge replaces its slot or it
    /// is being removed.
    pub fn is_covered(&self, installed: &Package) -> bool {
        self.is_removing(installed)
            || self
                .selected_in(&installed.slot_key())
                .iter()
                .any(|p| p.is_merge())
    }

    /// Selected packages matching `atom`.
    pub fn match_selected(&self, atom: &Dep, parent: Option<&Package>) -> Vec<Package> {
        self.selected()
            .filter(|p| atom_matches(atom, p, parent))
            .cloned()
            .collect()
    }

    /// Installed packages matching `atom` that nothing covers.
    pub fn match_installed(&self, atom: &Dep, parent: Option<&Package>) -> Vec<Package> {
        self.installed()
            .filter(|p| !self.is_covered(p))
            .filter(|p| atom_matches(atom, p, parent))
            .cloned()
            .collect()
    }

    /// Everything that would satisfy `atom` right now: selections first,
    /// then uncovered installed packages that are not also selected.
    pub fn match_pkgs(&self, atom: &Dep, parent: Option<&Package>) -> Vec<Package> {
        let mut out = self.match_selected(atom, parent);
        for pkg in self.match_installed(atom, parent) {
            if !out.contains(&pkg) {
                out.push(pkg);
            }
        }
        out
    }

    /// Slots holding more than one selection.
    pub fn slot_conflicts(&self) -> Vec<(SlotKey, Vec<Package>)> {
        self.selected
            .iter()
            .filter(|(_, pkgs)| pkgs.len() > 1)
            .map(|(k, pkgs)| (k.clone(), pkgs.clone()))
            .collect()
    }
}
