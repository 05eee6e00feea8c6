//! Collaborators of the scheduler: the build-script interpreter that runs
//! package phases, and the system load sampler.

use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::package::{Operation, Package, Provenance};

/// One step of a package merge or unmerge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `pkg_setup`: environment checks before building.
    Setup,
    /// `src_unpack`
    Unpack,
    /// `src_prepare`: patches.
    Prepare,
    /// `src_configure`
    Configure,
    /// `src_compile`
    Compile,
    /// `src_install` into the staging image.
    Install,
    /// Copy the image onto the live filesystem.
    Merge,
    /// `pkg_postinst`, after the merge.
    Postinst,
    /// `pkg_prerm`, before files are removed.
    Prerm,
    /// Remove the installed files.
    Unmerge,
    /// `pkg_postrm`, after removal.
    Postrm,
}

const EBUILD_PHASES: &[Phase] = &[
    Phase::Setup,
    Phase::Unpack,
    Phase::Prepare,
    Phase::Configure,
    Phase::Compile,
    Phase::Install,
    Phase::Merge,
    Phase::Postinst,
];
const BINARY_PHASES: &[Phase] = &[Phase::Setup, Phase::Merge, Phase::Postinst];
const UNINSTALL_PHASES: &[Phase] = &[Phase::Prerm, Phase::Unmerge, Phase::Postrm];

impl Phase {
    /// Phases to run for a package, in order. Kept packages have none.
    pub fn sequence(pkg: &Package) -> &'static [Phase] {
        match (pkg.operation(), pkg.provenance()) {
            (Operation::Uninstall, _) => UNINSTALL_PHASES,
            (Operation::NoMerge, _) => &[],
            (Operation::Merge, Provenance::Ebuild) => EBUILD_PHASES,
            (Operation::Merge, _) => BINARY_PHASES,
        }
    }

    /// Phases that modify the live filesystem; at most one runs at a time.
    pub fn is_serialized(self) -> bool {
        matches!(self, Phase::Merge | Phase::Unmerge)
    }

    /// The phase function name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Unpack => "unpack",
            Phase::Prepare => "prepare",
            Phase::Configure => "configure",
            Phase::Compile => "compile",
            Phase::Install => "install",
            Phase::Merge => "merge",
            Phase::Postinst => "postinst",
            Phase::Prerm => "prerm",
            Phase::Unmerge => "unmerge",
            Phase::Postrm => "postrm",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The build-script interpreter.
///
/// A nonzero exit code and an `Err` are both task failures.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Run one phase of a package and return its exit code.
    async fn execute_phase(&self, pkg: &Package, phase: Phase) -> Result<i32, ExecutorError>;

    /// Ask the running phases of a package to stop.
    ///
    /// Called on cancellation before the grace period starts; the default
    /// does nothing and relies on the task being aborted afterwards.
    async fn terminate(&self, _pkg: &Package) {}
}

/// Source of the system load average.
pub trait LoadSampler: Send + Sync {
    /// The current one-minute load average.
    fn current_load(&self) -> io::Result<f64>;
}

/// Reads the one-minute load average from `/proc/loadavg`.
#[derive(Debug, Clone)]
pub struct ProcLoadAvg {
    path: PathBuf,
}

impl Default for ProcLoadAvg {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/loadavg"),
        }
    }
}

impl ProcLoadAvg {
    /// Read from a different file with the `/proc/loadavg` format.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn parse_loadavg(content: &str) -> io::Result<f64> {
    content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed loadavg: {content:?}")))
}

impl LoadSampler for ProcLoadAvg {
    fn current_load(&self) -> io::Result<f64> {
        parse_loadavg(&std::fs::read_to_string(&self.path)?)
    }
}

/// A sampler returning a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f64);

impl LoadSampler for FixedLoad {
    fn current_load(&self) -> io::Result<f64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use portage_atom::Cpv;

    use super::*;
    use crate::package::PackageMetadata;

    fn pkg(provenance: Provenance, operation: Operation) -> Package {
        let meta = PackageMetadata::new(Cpv::parse("dev-libs/foo-1").unwrap());
        Package::new(Arc::new(meta), provenance, operation, BTreeSet::new())
    }

    #[test]
    fn phase_sequences() {
        let ebuild = Phase::sequence(&pkg(Provenance::Ebuild, Operation::Merge));
        assert_eq!(ebuild.first(), Some(&Phase::Setup));
        assert_eq!(ebuild.last(), Some(&Phase::Postinst));
        assert!(ebuild.contains(&Phase::Compile));

        let binary = Phase::sequence(&pkg(Provenance::Binary, Operation::Merge));
        assert_eq!(binary, [Phase::Setup, Phase::Merge, Phase::Postinst]);

        let removal = Phase::sequence(&pkg(Provenance::Installed, Operation::Uninstall));
        assert_eq!(removal, [Phase::Prerm, Phase::Unmerge, Phase::Postrm]);

        assert!(Phase::sequence(&pkg(Provenance::Installed, Operation::NoMerge)).is_empty());
    }

    #[test]
    fn only_filesystem_phases_are_serialized() {
        assert!(Phase::Merge.is_serialized());
        assert!(Phase::Unmerge.is_serialized());
        assert!(!Phase::Compile.is_serialized());
        assert_eq!(Phase::Postinst.to_string(), "postinst");
    }

    #[test]
    fn parses_loadavg() {
        let load = parse_loadavg("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert!((load - 0.52).abs() < f64::EPSILON);
        assert!(parse_loadavg("").is_err());
        assert!(parse_loadavg("abc 1 2").is_err());
    }
}
