//! Resolver and scheduler configuration.
//!
//! [`Options`] mirrors the emerge command-line switches the engine honours;
//! [`UseConfig`] carries USE flag and keyword policy. Both can be loaded from
//! a single TOML document with [`Config::from_toml_str`]:
//!
//! ```toml
//! [options]
//! deep = true
//! update = true
//! jobs = 4
//! load-average = 6.0
//!
//! [use]
//! enabled = ["ssl"]
//! disabled = ["doc"]
//!
//! [package-use]
//! "dev-libs/foo" = ["gui", "-ssl"]
//! ```
//!
//! Top-level keys such as `accept-keywords = ["=dev-libs/bar-2.0"]` must
//! precede the first table.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::atom::{Dep, parse_atom};
use crate::error::ConfigError;
use crate::matcher::ordered_by_atom_specificity;
use crate::package::Package;

/// Options controlling resolution and scheduling.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Options {
    /// Re-examine dependencies of installed packages.
    pub deep: bool,
    /// Prefer the best version over what is installed.
    pub update: bool,
    /// Prefer binary packages when available.
    pub usepkg: bool,
    /// Only use binary packages.
    pub usepkgonly: bool,
    /// Do not record selected packages in the world set.
    pub oneshot: bool,
    /// Maximum concurrent jobs; `0` means unbounded.
    pub jobs: usize,
    /// Do not start new jobs while the load average is at or above this.
    pub load_average: Option<f64>,
    /// Continue with independent packages after a failure.
    pub keep_going: bool,
    /// Backtracking budget.
    pub backtrack: usize,
    /// Suggest USE and keyword changes instead of failing outright.
    pub autounmask: bool,
    /// Restrict autounmask to USE changes.
    pub autounmask_use_only: bool,
    /// Keep backtracking after autounmask produced changes.
    pub autounmask_backtrack: bool,
    /// Do not create soname dependency edges.
    pub ignore_soname_deps: bool,
    /// Pull in build-time dependencies of installed packages.
    pub with_bdeps: bool,
    /// How often the load average is re-sampled, in milliseconds.
    pub load_check_interval_ms: u64,
    /// Grace period between termination and forced abort, in milliseconds.
    pub termination_grace_ms: u64,
    /// Per-task timeout in seconds.
    pub task_timeout_secs: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            deep: false,
            update: false,
            usepkg: false,
            usepkgonly: false,
            oneshot: false,
            jobs: 1,
            load_average: None,
            keep_going: false,
            backtrack: 10,
            autounmask: true,
            autounmask_use_only: false,
            autounmask_backtrack: false,
            ignore_soname_deps: true,
            with_bdeps: false,
            load_check_interval_ms: 30_000,
            termination_grace_ms: 5_000,
            task_timeout_secs: None,
        }
    }
}

impl Options {
    /// `None` when jobs are unbounded.
    pub fn max_jobs(&self) -> Option<usize> {
        (self.jobs > 0).then_some(self.jobs)
    }

    /// Whether binary packages may be selected at all.
    pub fn binaries_allowed(&self) -> bool {
        self.usepkg || self.usepkgonly
    }

    /// Load-average re-sampling interval.
    pub fn load_check_interval(&self) -> Duration {
        Duration::from_millis(self.load_check_interval_ms.max(1))
    }

    /// Termination grace period.
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    /// Per-task timeout.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// USE flag and keyword policy.
#[derive(Debug, Clone, Default)]
pub struct UseConfig {
    /// Flags that are always enabled.
    pub enabled: HashSet<String>,
    /// Flags that are always disabled.
    pub disabled: HashSet<String>,
    /// Per-package flag settings (`flag` / `-flag`), in document order.
    pub package_use: Vec<(Dep, Vec<String>)>,
    /// Atoms whose keyword-masked versions are accepted.
    pub accept_keywords: Vec<Dep>,
}

impl From<HashSet<String>> for UseConfig {
    /// Globally enable a set of flags.
    fn from(enabled: HashSet<String>) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }
}

impl UseConfig {
    /// Compute the USE flags an ebuild would be built with.
    ///
    /// Starts from IUSE defaults, applies the global enabled/disabled sets,
    /// then package.use entries from least to most specific. Flags outside
    /// IUSE are dropped.
    pub fn effective_use(&self, pkg: &Package) -> BTreeSet<String> {
        let meta = pkg.metadata();
        let mut flags: BTreeSet<String> = meta.iuse_defaults().map(str::to_string).collect();
        for flag in meta.iuse_flags() {
            if self.enabled.contains(flag) {
                flags.insert(flag.to_string());
            }
            if self.disabled.contains(flag) {
                flags.remove(flag);
            }
        }
        for settings in ordered_by_atom_specificity(&self.package_use, pkg) {
            for setting in settings {
                match setting.strip_prefix('-') {
                    Some(flag) => {
                        flags.remove(flag);
                    }
                    None => {
                        flags.insert(setting.clone());
                    }
                }
            }
        }
        flags.retain(|f| meta.has_iuse(f));
        flags
    }

    /// Whether a keyword mask on `pkg` is lifted by `accept_keywords`.
    pub fn keyword_accepted(&self, pkg: &Package) -> bool {
        self.accept_keywords
            .iter()
            .any(|atom| crate::matcher::atom_matches_ignoring_use(atom, pkg))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct RawConfig {
    options: Options,
    #[serde(rename = "use")]
    use_flags: RawUse,
    package_use: IndexMap<String, Vec<String>>,
    accept_keywords: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUse {
    enabled: Vec<String>,
    disabled: Vec<String>,
}

/// Options plus USE policy, as loaded from one document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Resolution and scheduling options.
    pub options: Options,
    /// USE and keyword policy.
    pub use_config: UseConfig,
}

impl Config {
    /// Parse a TOML configuration document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(s)?;
        let package_use = raw
            .package_use
            .into_iter()
            .map(|(atom, flags)| Ok::<_, ConfigError>((parse_atom(&atom)?, flags)))
            .collect::<Result<Vec<_>, _>>()?;
        let accept_keywords = raw
            .accept_keywords
            .iter()
            .map(|a| parse_atom(a))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Config {
            options: raw.options,
            use_config: UseConfig {
                enabled: raw.use_flags.enabled.into_iter().collect(),
                disabled: raw.use_flags.disabled.into_iter().collect(),
                package_use,
                accept_keywords,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use portage_atom::Cpv;

    use super::*;
    use crate::package::{Operation, PackageMetadata, Provenance};

    fn ebuild(cpv: &str, iuse: &[&str]) -> Package {
        let mut meta = PackageMetadata::new(Cpv::parse(cpv).unwrap());
        meta.iuse = iuse.iter().map(|s| s.to_string()).collect();
        Package::new(
            Arc::new(meta),
            Provenance::Ebuild,
            Operation::Merge,
            BTreeSet::new(),
        )
    }

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.backtrack, 10);
        assert_eq!(opts.max_jobs(), Some(1));
        assert!(opts.autounmask);
        assert!(opts.ignore_soname_deps);
        assert_eq!(Options { jobs: 0, ..opts }.max_jobs(), None);
    }

    #[test]
    fn load_full_document() {
        let cfg = Config::from_toml_str(
            r#"
            accept-keywords = ["=dev-libs/bar-2.0"]

            [options]
            deep = true
            update = true
            jobs = 4
            load-average = 6.5
            keep-going = true
            backtrack = 3

            [use]
            enabled = ["ssl"]
            disabled = ["doc"]

            [package-use]
            "dev-libs/foo" = ["gui"]
            "=dev-libs/foo-1.0" = ["-gui"]
            "#,
        )
        .unwrap();
        assert!(cfg.options.deep && cfg.options.update && cfg.options.keep_going);
        assert_eq!(cfg.options.jobs, 4);
        assert_eq!(cfg.options.load_average, Some(6.5));
        assert_eq!(cfg.options.backtrack, 3);
        assert!(cfg.use_config.enabled.contains("ssl"));
        assert_eq!(cfg.use_config.package_use.len(), 2);
        assert_eq!(cfg.use_config.accept_keywords.len(), 1);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.options, Options::default());
    }

    #[test]
    fn invalid_atom_key_is_rejected() {
        let err = Config::from_toml_str("[package-use]\n\"not an atom\" = [\"x\"]\n");
        assert!(matches!(err, Err(ConfigError::Atom(_))));
    }

    #[test]
    fn unknown_option_type_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("[options]\njobs = \"many\"\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn effective_use_layers() {
        let pkg = ebuild("dev-libs/foo-1.0", &["+doc", "ssl", "gui", "test"]);
        let mut cfg = UseConfig::from(HashSet::from(["ssl".to_string(), "unrelated".to_string()]));
        cfg.disabled.insert("doc".into());
        cfg.package_use
            .push((parse_atom("=dev-libs/foo-1.0").unwrap(), vec!["-gui".into()]));
        cfg.package_use
            .push((parse_atom("dev-libs/foo").unwrap(), vec!["gui".into(), "test".into()]));

        let flags = cfg.effective_use(&pkg);
        let got: Vec<&str> = flags.iter().map(String::as_str).collect();
        // The exact-version entry is more specific and wins over the bare one.
        assert_eq!(got, vec!["ssl", "test"]);
    }

    #[test]
    fn keyword_acceptance() {
        let pkg = ebuild("dev-libs/bar-2.0", &[]);
        let mut cfg = UseConfig::default();
        assert!(!cfg.keyword_accepted(&pkg));
        cfg.accept_keywords.push(parse_atom("=dev-libs/bar-2.0").unwrap());
        assert!(cfg.keyword_accepted(&pkg));
    }
}
