//! Package repository abstraction.
//!
//! [`PackageRepository`] is the read-only metadata oracle the resolver
//! consults: ebuild repositories, the installed-package database and binary
//! package directories are all repositories. [`InMemoryRepository`] is a
//! simple implementation for tests and demos.

use std::collections::HashMap;

use indexmap::IndexMap;
use portage_atom::{Cpn, Cpv};

use crate::atom::{Dep, DepExt};
use crate::error::RepositoryError;
use crate::package::PackageMetadata;

/// Read-only package database.
pub trait PackageRepository {
    /// Return all distinct category/package names in the repository.
    fn all_packages(&self) -> Vec<Cpn>;

    /// Return every version available for the given category/package.
    fn versions_for(&self, cpn: &Cpn) -> Vec<PackageMetadata>;

    /// Records matching an atom's name, version, slot and repository.
    ///
    /// USE dependencies are not checked here: they depend on how a record is
    /// configured, which only the resolver knows.
    fn match_atom(&self, atom: &Dep) -> Vec<PackageMetadata> {
        self.versions_for(&atom.cpn)
            .into_iter()
            .filter(|meta| {
                atom.matches_version(&meta.cpv.version)
                    && atom.slot().is_none_or(|s| s == meta.slot())
                    && atom.subslot().is_none_or(|s| s == meta.subslot())
                    && atom
                        .repo
                        .as_deref()
                        .is_none_or(|r| meta.repo.as_deref() == Some(r))
            })
            .collect()
    }

    /// Fetch raw metadata values for one package.
    fn aux_get(&self, cpv: &Cpv, keys: &[&str]) -> Result<HashMap<String, String>, RepositoryError> {
        let meta = self
            .versions_for(&cpv.cpn)
            .into_iter()
            .find(|m| m.cpv == *cpv)
            .ok_or_else(|| RepositoryError::PackageNotFound(cpv.to_string()))?;
        keys.iter()
            .map(|key| {
                meta.aux_get(key)
                    .map(|value| (key.to_string(), value))
                    .ok_or_else(|| RepositoryError::UnknownKey {
                        cpv: cpv.to_string(),
                        key: key.to_string(),
                    })
            })
            .collect()
    }
}

/// In-memory repository that keeps insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    packages: IndexMap<Cpn, Vec<PackageMetadata>>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package version to the repository.
    pub fn add(&mut self, meta: PackageMetadata) {
        self.packages
            .entry(meta.cpv.cpn.clone())
            .or_default()
            .push(meta);
    }

    /// Remove a version; returns whether it was present.
    pub fn remove(&mut self, cpv: &Cpv) -> bool {
        let Some(versions) = self.packages.get_mut(&cpv.cpn) else {
            return false;
        };
        let before = versions.len();
        versions.retain(|m| m.cpv != *cpv);
        before != versions.len()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    /// Whether the repository has no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<PackageMetadata> for InMemoryRepository {
    fn from_iter<I: IntoIterator<Item = PackageMetadata>>(iter: I) -> Self {
        let mut repo = Self::new();
        for meta in iter {
            repo.add(meta);
        }
        repo
    }
}

impl PackageRepository for InMemoryRepository {
    fn all_packages(&self) -> Vec<Cpn> {
        self.packages
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn versions_for(&self, cpn: &Cpn) -> Vec<PackageMetadata> {
        self.packages.get(cpn).cloned().unwrap_or_default()
    }
}
