//! Package records and graph nodes.
//!
//! [`PackageMetadata`] is the raw record returned by a metadata provider: the
//! declared dependency strings, IUSE, slot, sonames and so on. A [`Package`]
//! is a concrete, resolved choice: a record plus its provenance (ebuild,
//! binary, installed), the operation planned for it and the USE flags it is
//! built with. Packages are cheap to clone and compare by identity.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use portage_atom::{Cpn, Cpv, Version};

use crate::version::compare_versions;

/// Metadata for one package version as provided by a repository.
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    /// The fully-qualified category/package/version.
    pub cpv: Cpv,
    /// The slot this version occupies (`"0"` when absent).
    pub slot: Option<String>,
    /// Sub-slot for ABI tracking (defaults to the slot).
    pub subslot: Option<String>,
    /// Declared IUSE tokens; a leading `+` enables the flag by default.
    pub iuse: Vec<String>,
    /// Flags the package was built with (installed and binary records).
    pub use_flags: HashSet<String>,
    /// Repository this version comes from (e.g. `"gentoo"`).
    pub repo: Option<String>,
    /// Raw dependency strings, separated by class.
    pub dependencies: PackageDeps,
    /// Raw REQUIRED_USE string.
    pub required_use: String,
    /// Sonames this package provides.
    pub provides: Vec<String>,
    /// Sonames this package links against.
    pub requires: Vec<String>,
    /// Accepted keywords of the record.
    pub keywords: Vec<String>,
    /// Why the record is not visible, if it is masked.
    pub mask: Option<MaskReason>,
    /// EAPI the record declares.
    pub eapi: String,
    /// Bytes to fetch before building or installing.
    pub download_size: u64,
}

impl PackageMetadata {
    /// A record with slot `0`, no dependencies and no USE flags.
    pub fn new(cpv: Cpv) -> Self {
        Self {
            cpv,
            slot: Some("0".into()),
            subslot: None,
            iuse: Vec::new(),
            use_flags: HashSet::new(),
            repo: None,
            dependencies: PackageDeps::default(),
            required_use: String::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            keywords: Vec::new(),
            mask: None,
            eapi: "8".into(),
            download_size: 0,
        }
    }

    /// Slot, defaulting to `"0"`.
    pub fn slot(&self) -> &str {
        self.slot.as_deref().unwrap_or("0")
    }

    /// Sub-slot, defaulting to the slot.
    pub fn subslot(&self) -> &str {
        self.subslot.as_deref().unwrap_or_else(|| self.slot())
    }

    /// IUSE flag names with default markers stripped.
    pub fn iuse_flags(&self) -> impl Iterator<Item = &str> {
        self.iuse
            .iter()
            .map(|f| f.trim_start_matches(['+', '-']))
    }

    /// Flags enabled by default via `+flag` in IUSE.
    pub fn iuse_defaults(&self) -> impl Iterator<Item = &str> {
        self.iuse.iter().filter_map(|f| f.strip_prefix('+'))
    }

    /// Whether `flag` is declared in IUSE.
    pub fn has_iuse(&self, flag: &str) -> bool {
        self.iuse_flags().any(|f| f == flag)
    }

    /// Look up a metadata key the way `aux_get` does.
    ///
    /// Multi-valued keys are space-joined; unknown keys return `None`.
    pub fn aux_get(&self, key: &str) -> Option<String> {
        let joined = |v: &[String]| v.join(" ");
        Some(match key {
            "SLOT" => match &self.subslot {
                Some(sub) => format!("{}/{}", self.slot(), sub),
                None => self.slot().to_string(),
            },
            "DEPEND" => self.dependencies.depend.clone(),
            "RDEPEND" => self.dependencies.rdepend.clone(),
            "BDEPEND" => self.dependencies.bdepend.clone(),
            "PDEPEND" => self.dependencies.pdepend.clone(),
            "IDEPEND" => self.dependencies.idepend.clone(),
            "IUSE" => joined(&self.iuse),
            "USE" => {
                let mut flags: Vec<&String> = self.use_flags.iter().collect();
                flags.sort();
                flags.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
            }
            "REQUIRED_USE" => self.required_use.clone(),
            "KEYWORDS" => joined(&self.keywords),
            "EAPI" => self.eapi.clone(),
            "PROVIDES" => joined(&self.provides),
            "REQUIRES" => joined(&self.requires),
            "repository" => self.repo.clone().unwrap_or_default(),
            "SIZE" => self.download_size.to_string(),
            _ => return None,
        })
    }
}

/// Raw dependency strings separated by PMS dependency class.
#[derive(Debug, Clone, Default)]
pub struct PackageDeps {
    /// Build-time dependencies (`DEPEND`).
    pub depend: String,
    /// Runtime dependencies (`RDEPEND`).
    pub rdepend: String,
    /// Build host dependencies (`BDEPEND`).
    pub bdepend: String,
    /// Post-merge dependencies (`PDEPEND`).
    pub pdepend: String,
    /// Install-time dependencies (`IDEPEND`).
    pub idepend: String,
}

impl PackageDeps {
    /// Iterate over all non-empty dependency classes.
    pub fn iter_classes(&self) -> impl Iterator<Item = (DepClass, &str)> {
        [
            (DepClass::Depend, self.depend.as_str()),
            (DepClass::Rdepend, self.rdepend.as_str()),
            (DepClass::Bdepend, self.bdepend.as_str()),
            (DepClass::Pdepend, self.pdepend.as_str()),
            (DepClass::Idepend, self.idepend.as_str()),
        ]
        .into_iter()
        .filter(|(_, s)| !s.trim().is_empty())
    }
}

/// PMS dependency class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepClass {
    /// `DEPEND`: build-time.
    Depend,
    /// `RDEPEND`: runtime.
    Rdepend,
    /// `BDEPEND`: build host.
    Bdepend,
    /// `PDEPEND`: post-merge.
    Pdepend,
    /// `IDEPEND`: install-time.
    Idepend,
}

impl DepClass {
    /// DEPEND and BDEPEND are only needed to build.
    pub fn is_buildtime(self) -> bool {
        matches!(self, DepClass::Depend | DepClass::Bdepend)
    }
}

impl fmt::Display for DepClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepClass::Depend => write!(f, "DEPEND"),
            DepClass::Rdepend => write!(f, "RDEPEND"),
            DepClass::Bdepend => write!(f, "BDEPEND"),
            DepClass::Pdepend => write!(f, "PDEPEND"),
            DepClass::Idepend => write!(f, "IDEPEND"),
        }
    }
}

/// Why a record is not visible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaskReason {
    /// Only available under the given (unstable) keyword, e.g. `~amd64`.
    Keyword(String),
    /// Masked by package.mask, with the mask comment.
    PackageMask(String),
}

impl fmt::Display for MaskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskReason::Keyword(k) => write!(f, "missing keyword ({k})"),
            MaskReason::PackageMask(reason) => write!(f, "package.mask ({reason})"),
        }
    }
}

/// Where a package comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provenance {
    /// Built from source.
    Ebuild,
    /// Prebuilt binary package.
    Binary,
    /// Already installed.
    Installed,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Ebuild => write!(f, "ebuild"),
            Provenance::Binary => write!(f, "binary"),
            Provenance::Installed => write!(f, "installed"),
        }
    }
}

/// What the plan does with a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Build (or unpack) and install.
    Merge,
    /// Already installed; kept as is.
    NoMerge,
    /// Remove from the system.
    Uninstall,
}

/// How a merge step relates to what is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Nothing installed in the slot.
    New,
    /// Replaces a lower version.
    Upgrade,
    /// Replaces a higher version.
    Downgrade,
    /// Replaces the same version.
    Reinstall,
    /// Removes the package.
    Uninstall,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ChangeKind::New => "N",
            ChangeKind::Upgrade => "U",
            ChangeKind::Downgrade => "UD",
            ChangeKind::Reinstall => "R",
            ChangeKind::Uninstall => "uninstall",
        };
        write!(f, "{tag}")
    }
}

/// `(category/package, slot)`: at most one package may be merged per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    /// Package name.
    pub cpn: Cpn,
    /// Slot.
    pub slot: String,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cpn, self.slot)
    }
}

/// Identifies a record independently of USE and planned operation.
///
/// Backtracking masks and autounmask changes are keyed by this, since a
/// package's graph identity changes whenever its USE changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    /// Package name.
    pub cpn: Cpn,
    /// Version.
    pub version: Version,
    /// Source repository.
    pub repo: Option<String>,
    /// Provenance.
    pub provenance: Provenance,
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cpn, self.version)?;
        if let Some(repo) = &self.repo {
            write!(f, "::{}", repo)?;
        }
        write!(f, " ({})", self.provenance)
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct Identity {
    candidate: CandidateKey,
    operation: Operation,
    use_enabled: BTreeSet<String>,
}

#[derive(Debug)]
struct PackageInner {
    meta: Arc<PackageMetadata>,
    identity: Identity,
}

/// A concrete package selected into the dependency graph.
///
/// Equality and hashing cover the record, provenance, operation and USE;
/// changing USE yields a different package.
#[derive(Debug, Clone)]
pub struct Package {
    inner: Arc<PackageInner>,
}

impl Package {
    /// Create a package from a record.
    pub fn new(
        meta: Arc<PackageMetadata>,
        provenance: Provenance,
        operation: Operation,
        use_enabled: BTreeSet<String>,
    ) -> Self {
        let candidate = CandidateKey {
            cpn: meta.cpv.cpn.clone(),
            version: meta.cpv.version.clone(),
            repo: meta.repo.clone(),
            provenance,
        };
        Self {
            inner: Arc::new(PackageInner {
                meta,
                identity: Identity {
                    candidate,
                    operation,
                    use_enabled,
                },
            }),
        }
    }

    /// An installed record kept as-is, with its built USE.
    pub fn installed(meta: Arc<PackageMetadata>) -> Self {
        let use_enabled = meta.use_flags.iter().cloned().collect();
        Self::new(meta, Provenance::Installed, Operation::NoMerge, use_enabled)
    }

    /// The underlying record.
    pub fn metadata(&self) -> &PackageMetadata {
        &self.inner.meta
    }

    /// Shared handle to the underlying record.
    pub fn metadata_arc(&self) -> &Arc<PackageMetadata> {
        &self.inner.meta
    }

    /// Category/package/version.
    pub fn cpv(&self) -> &Cpv {
        &self.inner.meta.cpv
    }

    /// Category/package.
    pub fn cpn(&self) -> &Cpn {
        &self.inner.meta.cpv.cpn
    }

    /// Version.
    pub fn version(&self) -> &Version {
        &self.inner.meta.cpv.version
    }

    /// Slot.
    pub fn slot(&self) -> &str {
        self.inner.meta.slot()
    }

    /// Sub-slot.
    pub fn subslot(&self) -> &str {
        self.inner.meta.subslot()
    }

    /// Source repository.
    pub fn repo(&self) -> Option<&str> {
        self.inner.meta.repo.as_deref()
    }

    /// Provenance.
    pub fn provenance(&self) -> Provenance {
        self.inner.identity.candidate.provenance
    }

    /// Planned operation.
    pub fn operation(&self) -> Operation {
        self.inner.identity.operation
    }

    /// Flags this package is (or will be) built with.
    pub fn use_enabled(&self) -> &BTreeSet<String> {
        &self.inner.identity.use_enabled
    }

    /// Whether `flag` is enabled.
    pub fn is_enabled(&self, flag: &str) -> bool {
        self.inner.identity.use_enabled.contains(flag)
    }

    /// True when the package is already on the system.
    pub fn is_installed(&self) -> bool {
        self.provenance() == Provenance::Installed
    }

    /// True for merge operations.
    pub fn is_merge(&self) -> bool {
        self.operation() == Operation::Merge
    }

    /// The `(cpn, slot)` key.
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            cpn: self.cpn().clone(),
            slot: self.slot().to_string(),
        }
    }

    /// The USE-independent record key.
    pub fn candidate_key(&self) -> CandidateKey {
        self.inner.identity.candidate.clone()
    }

    /// The same record with a different operation.
    pub fn with_operation(&self, operation: Operation) -> Package {
        Self::new(
            self.inner.meta.clone(),
            self.provenance(),
            operation,
            self.use_enabled().clone(),
        )
    }

    /// Compare against an installed package of the same slot.
    pub fn change_against(&self, installed: Option<&Package>) -> ChangeKind {
        if self.operation() == Operation::Uninstall {
            return ChangeKind::Uninstall;
        }
        match installed {
            None => ChangeKind::New,
            Some(old) => match compare_versions(self.version(), old.version()) {
                std::cmp::Ordering::Greater => ChangeKind::Upgrade,
                std::cmp::Ordering::Less => ChangeKind::Downgrade,
                std::cmp::Ordering::Equal => ChangeKind::Reinstall,
            },
        }
    }

    /// Long human-readable form, e.g. `[ebuild merge] dev-libs/foo-1.0:0::gentoo`.
    pub fn describe(&self) -> String {
        let op = match self.operation() {
            Operation::Merge => "merge",
            Operation::NoMerge => "nomerge",
            Operation::Uninstall => "uninstall",
        };
        let mut s = format!("[{} {}] {}:{}", self.provenance(), op, self.cpv(), self.slot());
        if self.subslot() != self.slot() {
            s.push('/');
            s.push_str(self.subslot());
        }
        if let Some(repo) = self.repo() {
            s.push_str("::");
            s.push_str(repo);
        }
        s
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.identity == other.inner.identity
    }
}

impl Eq for Package {}

impl std::hash::Hash for Package {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.identity.hash(state);
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cpv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(cpv: &str) -> PackageMetadata {
        PackageMetadata::new(Cpv::parse(cpv).unwrap())
    }

    fn flags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn iuse_defaults_and_names() {
        let mut m = meta("dev-libs/foo-1.0");
        m.iuse = vec!["+ssl".into(), "-doc".into(), "gui".into()];
        assert_eq!(m.iuse_flags().collect::<Vec<_>>(), vec!["ssl", "doc", "gui"]);
        assert_eq!(m.iuse_defaults().collect::<Vec<_>>(), vec!["ssl"]);
        assert!(m.has_iuse("gui"));
        assert!(!m.has_iuse("x"));
    }

    #[test]
    fn slot_defaults() {
        let mut m = meta("dev-libs/foo-1.0");
        m.slot = None;
        assert_eq!(m.slot(), "0");
        assert_eq!(m.subslot(), "0");
        m.slot = Some("2".into());
        m.subslot = Some("2.1".into());
        assert_eq!(m.aux_get("SLOT").as_deref(), Some("2/2.1"));
    }

    #[test]
    fn aux_get_keys() {
        let mut m = meta("dev-libs/foo-1.0");
        m.dependencies.rdepend = "dev-libs/bar".into();
        m.keywords = vec!["amd64".into(), "~arm64".into()];
        assert_eq!(m.aux_get("RDEPEND").as_deref(), Some("dev-libs/bar"));
        assert_eq!(m.aux_get("KEYWORDS").as_deref(), Some("amd64 ~arm64"));
        assert_eq!(m.aux_get("DEPEND").as_deref(), Some(""));
        assert_eq!(m.aux_get("NOPE"), None);
    }

    #[test]
    fn iter_classes_skips_blank() {
        let mut m = meta("dev-libs/foo-1.0");
        m.dependencies.depend = "dev-libs/a".into();
        m.dependencies.pdepend = "   ".into();
        let classes: Vec<DepClass> = m.dependencies.iter_classes().map(|(c, _)| c).collect();
        assert_eq!(classes, vec![DepClass::Depend]);
    }

    #[test]
    fn identity_includes_use_and_operation() {
        let m = Arc::new(meta("dev-libs/foo-1.0"));
        let a = Package::new(m.clone(), Provenance::Ebuild, Operation::Merge, flags(&["ssl"]));
        let b = Package::new(m.clone(), Provenance::Ebuild, Operation::Merge, flags(&["ssl"]));
        let c = Package::new(m.clone(), Provenance::Ebuild, Operation::Merge, flags(&[]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, a.with_operation(Operation::NoMerge));
        assert_eq!(a.candidate_key(), c.candidate_key());
    }

    #[test]
    fn change_kinds() {
        let old = Package::installed(Arc::new(meta("dev-libs/foo-1.0")));
        let up = Package::new(
            Arc::new(meta("dev-libs/foo-2.0")),
            Provenance::Ebuild,
            Operation::Merge,
            BTreeSet::new(),
        );
        let same = Package::new(
            Arc::new(meta("dev-libs/foo-1.0")),
            Provenance::Ebuild,
            Operation::Merge,
            BTreeSet::new(),
        );
        assert_eq!(up.change_against(None), ChangeKind::New);
        assert_eq!(up.change_against(Some(&old)), ChangeKind::Upgrade);
        assert_eq!(old.change_against(Some(&up)), ChangeKind::Downgrade);
        assert_eq!(same.change_against(Some(&old)), ChangeKind::Reinstall);
        assert_eq!(
            old.with_operation(Operation::Uninstall).change_against(Some(&old)),
            ChangeKind::Uninstall
        );

        let longer = Package::new(
            Arc::new(meta("dev-libs/foo-1.0.0")),
            Provenance::Ebuild,
            Operation::Merge,
            BTreeSet::new(),
        );
        assert_eq!(longer.change_against(Some(&old)), ChangeKind::Upgrade);
    }

    #[test]
    fn describe_includes_subslot_and_repo() {
        let mut m = meta("dev-libs/foo-1.0");
        m.subslot = Some("1.0".into());
        m.repo = Some("gentoo".into());
        let p = Package::installed(Arc::new(m));
        assert_eq!(p.describe(), "[installed nomerge] dev-libs/foo-1.0:0/1.0::gentoo");
    }
}
