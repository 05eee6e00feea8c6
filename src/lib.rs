//! Dependency resolution, merge ordering and build scheduling for
//! Portage-style package managers.
//!
//! Atoms, versions and dependency strings are parsed with [`portage_atom`];
//! this crate adds PMS version ordering and atom matching on top, the
//! REQUIRED_USE grammar, and the engine:
//!
//! - [`Resolver`] expands root atoms into a [`DependencyGraph`] of
//!   [`Package`]s, backtracking over slot conflicts and unsatisfiable
//!   dependencies, and reports a [`Resolution`] with every [`Problem`] and
//!   configuration [`Suggestion`] found.
//! - [`merge_order`] turns the graph into a [`MergeList`] of parallel
//!   batches, breaking dependency cycles by edge [`Priority`].
//! - [`Scheduler`] runs a merge list through a [`BuildExecutor`] with
//!   job-count and load-average admission control.
//!
//! Metadata comes from [`PackageRepository`] implementations; an
//! [`InMemoryRepository`] is provided.

pub mod atom;
pub mod backtrack;
pub mod config;
pub mod depstring;
pub mod error;
pub mod executor;
pub mod graph;
pub mod matcher;
pub mod merge_order;
pub mod package;
pub mod priority;
pub mod problem;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod task;
pub mod tracker;
pub mod version;

pub use atom::{Blocker, Dep, DepExt, SlotDep, SlotOperator, UseDefault, UseDep, UseDepKind, parse_atom};
pub use config::{Config, Options, UseConfig};
pub use depstring::{DepNode, FlagTerm, parse_dependencies, parse_required_use};
pub use error::{AtomError, ConfigError, DepStringError, ExecutorError, GraphError, RepositoryError};
pub use executor::{BuildExecutor, FixedLoad, LoadSampler, Phase, ProcLoadAvg};
pub use graph::{DependencyGraph, PackageId};
pub use matcher::{atom_matches, match_candidates};
pub use merge_order::{CycleBreak, MergeList, MergeStep, OrderError, OrderMode, merge_order, unmerge_order};
pub use package::{
    CandidateKey, ChangeKind, DepClass, MaskReason, Operation, Package, PackageDeps, PackageMetadata, Provenance,
    SlotKey,
};
pub use priority::Priority;
pub use problem::{Problem, Resolution, Suggestion};
pub use repository::{InMemoryRepository, PackageRepository};
pub use resolver::{Resolver, ResolverContext};
pub use scheduler::{CancelHandle, ChangeCounts, Scheduler, SchedulerConfig, SchedulerReport, TaskFailure};
pub use task::{Task, TaskState};
pub use version::{compare_versions, vercmp, version_matches};

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use portage_atom::Cpv;

    use super::*;

    /// Helper: a record in slot `slot` with the given RDEPEND.
    fn pkg(cpv: &str, slot: &str, rdepend: &str) -> PackageMetadata {
        let mut meta = PackageMetadata::new(Cpv::parse(cpv).unwrap());
        meta.slot = Some(slot.into());
        meta.dependencies.rdepend = rdepend.into();
        meta
    }

    /// Helper: a record with a sub-slot.
    fn pkg_subslot(cpv: &str, slot: &str, subslot: &str) -> PackageMetadata {
        let mut meta = pkg(cpv, slot, "");
        meta.subslot = Some(subslot.into());
        meta
    }

    fn resolve_with(
        repo: &InMemoryRepository,
        installed: &InMemoryRepository,
        options: Options,
        use_config: UseConfig,
        roots: &[&str],
    ) -> Resolution {
        let ctx = ResolverContext::new(repo, installed)
            .with_options(options)
            .with_use_config(use_config);
        Resolver::new(ctx).resolve_args(roots)
    }

    fn resolve(repo: &InMemoryRepository, roots: &[&str]) -> Resolution {
        resolve_with(repo, &InMemoryRepository::new(), Options::default(), UseConfig::default(), roots)
    }

    fn plan(res: &Resolution) -> Vec<String> {
        res.merge_list
            .as_ref()
            .map(|list| list.packages().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn build_time_cycle_is_reported() {
        let mut a = pkg("dev-libs/a-1", "0", "");
        a.dependencies.depend = "dev-libs/b".into();
        let mut b = pkg("dev-libs/b-1", "0", "");
        b.dependencies.depend = "dev-libs/a".into();
        let repo: InMemoryRepository = [a, b].into_iter().collect();

        let res = resolve(&repo, &["dev-libs/a"]);

        // Both edges are hard build-time edges: nothing may be broken.
        assert!(res.merge_list.is_none());
        match &res.problems[..] {
            [Problem::CircularDependency { cycle, .. }] => {
                let mut names: Vec<String> = cycle.iter().map(|p| p.to_string()).collect();
                names.sort();
                assert_eq!(names, ["dev-libs/a-1", "dev-libs/b-1"]);
            }
            other => panic!("unexpected problems: {other:?}"),
        }
    }

    #[test]
    fn slot_operator_dependency_triggers_rebuild() {
        let consumer = pkg("app-misc/c-1", "0", ">=dev-libs/b-1.5:0=");
        let repo: InMemoryRepository = [pkg("dev-libs/b-2", "0", ""), consumer.clone()].into_iter().collect();
        let installed: InMemoryRepository = [pkg("dev-libs/b-1", "0", ""), consumer].into_iter().collect();
        let options = Options {
            update: true,
            deep: true,
            ..Options::default()
        };

        let res = resolve_with(&repo, &installed, options, UseConfig::default(), &["app-misc/c"]);

        assert!(res.is_success(), "{res}");
        let list = res.merge_list.expect("plan");
        let steps: Vec<(String, ChangeKind)> =
            list.steps.iter().map(|s| (s.package.to_string(), s.change)).collect();
        assert_eq!(
            steps,
            [
                ("dev-libs/b-2".to_string(), ChangeKind::Upgrade),
                ("app-misc/c-1".to_string(), ChangeKind::Reinstall),
            ]
        );
    }

    #[test]
    fn any_of_skips_masked_branch() {
        let mut x = pkg("dev-libs/x-1", "0", "");
        x.mask = Some(MaskReason::PackageMask("security".into()));
        let repo: InMemoryRepository = [
            pkg("app-misc/top-1", "0", "|| ( dev-libs/x dev-libs/y )"),
            x,
            pkg("dev-libs/y-1", "0", ""),
        ]
        .into_iter()
        .collect();

        let res = resolve(&repo, &["app-misc/top"]);

        assert!(res.is_success(), "{res}");
        assert_eq!(plan(&res), ["dev-libs/y-1", "app-misc/top-1"]);
    }

    #[test]
    fn slots_blocking_each_other_conflict() {
        let repo: InMemoryRepository = [
            pkg("app-misc/p-1", "0", "dev-libs/d:1"),
            pkg("app-misc/q-1", "0", "dev-libs/d:2"),
            pkg("dev-libs/d-1", "1", "!!dev-libs/d:2"),
            pkg("dev-libs/d-2", "2", ""),
        ]
        .into_iter()
        .collect();

        let res = resolve(&repo, &["app-misc/p", "app-misc/q"]);

        assert!(res.merge_list.is_none());
        assert!(res.attempts > 1);
        match &res.problems[..] {
            [Problem::SlotConflict { packages, .. }] => {
                let names: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
                assert_eq!(names, ["dev-libs/d-1", "dev-libs/d-2"]);
            }
            other => panic!("unexpected problems: {other:?}"),
        }
    }

    #[test]
    fn all_dependency_classes_are_followed() {
        let mut top = pkg("app-misc/top-1", "0", "dev-libs/run");
        top.dependencies.depend = "dev-libs/build".into();
        top.dependencies.bdepend = "dev-util/tool".into();
        top.dependencies.pdepend = "app-misc/plugin".into();
        let repo: InMemoryRepository = [
            top,
            pkg("dev-libs/run-1", "0", ""),
            pkg("dev-libs/build-1", "0", ""),
            pkg("dev-util/tool-1", "0", ""),
            pkg("app-misc/plugin-1", "0", ""),
        ]
        .into_iter()
        .collect();

        let res = resolve(&repo, &["app-misc/top"]);

        assert!(res.is_success(), "{res}");
        let order = plan(&res);
        assert_eq!(order.len(), 5);
        let pos = |name: &str| order.iter().position(|p| p == name).unwrap();
        assert!(pos("dev-libs/build-1") < pos("app-misc/top-1"));
        assert!(pos("dev-util/tool-1") < pos("app-misc/top-1"));
        assert!(pos("dev-libs/run-1") < pos("app-misc/top-1"));
        // PDEPEND goes after its parent.
        assert!(pos("app-misc/plugin-1") > pos("app-misc/top-1"));
    }

    #[test]
    fn use_conditional_follows_configuration() {
        let mut curl = pkg("net-misc/curl-8", "0", "ssl? ( dev-libs/openssl )");
        curl.iuse = vec!["ssl".into()];
        let repo: InMemoryRepository = [curl, pkg("dev-libs/openssl-3", "0", "")].into_iter().collect();
        let installed = InMemoryRepository::new();

        let res = resolve_with(&repo, &installed, Options::default(), UseConfig::default(), &["net-misc/curl"]);
        assert_eq!(plan(&res), ["net-misc/curl-8"]);

        let ssl = UseConfig::from(HashSet::from(["ssl".to_string()]));
        let res = resolve_with(&repo, &installed, Options::default(), ssl, &["net-misc/curl"]);
        assert_eq!(plan(&res), ["dev-libs/openssl-3", "net-misc/curl-8"]);
    }

    #[test]
    fn repository_constraint_selects_record() {
        let mut main = pkg("dev-libs/foo-1", "0", "");
        main.repo = Some("gentoo".into());
        let mut overlay = pkg("dev-libs/foo-2", "0", "");
        overlay.repo = Some("guru".into());
        let repo: InMemoryRepository = [main, overlay].into_iter().collect();

        assert_eq!(plan(&resolve(&repo, &["dev-libs/foo"])), ["dev-libs/foo-2"]);
        assert_eq!(plan(&resolve(&repo, &["dev-libs/foo::gentoo"])), ["dev-libs/foo-1"]);
    }

    #[test]
    fn subslot_constraint_selects_record() {
        let repo: InMemoryRepository = [
            pkg_subslot("dev-libs/openssl-1.1.1", "0", "1.1"),
            pkg_subslot("dev-libs/openssl-3.0.0", "0", "3"),
        ]
        .into_iter()
        .collect();

        assert_eq!(plan(&resolve(&repo, &["dev-libs/openssl:0/1.1"])), ["dev-libs/openssl-1.1.1"]);
        assert_eq!(plan(&resolve(&repo, &["dev-libs/openssl:0"])), ["dev-libs/openssl-3.0.0"]);
    }

    #[test]
    fn installed_package_without_ebuild_satisfies_dependency() {
        let repo: InMemoryRepository = [pkg("app-misc/top-1", "0", "dev-libs/legacy")].into_iter().collect();
        let installed: InMemoryRepository = [pkg("dev-libs/legacy-1", "0", "")].into_iter().collect();

        let res = resolve_with(&repo, &installed, Options::default(), UseConfig::default(), &["app-misc/top"]);

        assert!(res.is_success(), "{res}");
        assert_eq!(plan(&res), ["app-misc/top-1"]);
    }

    #[test]
    fn installed_slots_are_independent() {
        let repo: InMemoryRepository = [
            pkg("dev-lang/python-3.11.9", "3.11", ""),
            pkg("dev-lang/python-3.12.5", "3.12", ""),
        ]
        .into_iter()
        .collect();
        let installed: InMemoryRepository = [pkg("dev-lang/python-3.11.9", "3.11", "")].into_iter().collect();

        let res = resolve_with(
            &repo,
            &installed,
            Options::default(),
            UseConfig::default(),
            &["dev-lang/python:3.12", "dev-lang/python:3.11"],
        );

        assert!(res.is_success(), "{res}");
        assert_eq!(plan(&res), ["dev-lang/python-3.12.5"]);
        assert_eq!(res.merge_list.unwrap().steps[0].change, ChangeKind::New);
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl BuildExecutor for AlwaysSucceeds {
        async fn execute_phase(&self, _pkg: &Package, _phase: Phase) -> Result<i32, ExecutorError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_plan_runs_to_completion() {
        let repo: InMemoryRepository = [
            pkg("app-misc/top-1", "0", "dev-libs/a dev-libs/b"),
            pkg("dev-libs/a-1", "0", ""),
            pkg("dev-libs/b-1", "0", "dev-libs/a"),
        ]
        .into_iter()
        .collect();
        let res = resolve(&repo, &["app-misc/top"]);
        let list = res.merge_list.expect("plan");

        let config = SchedulerConfig {
            max_jobs: Some(4),
            ..SchedulerConfig::default()
        };
        let report = Scheduler::new(config, Arc::new(AlwaysSucceeds)).run(&list).await;

        assert!(report.is_success(), "{report}");
        assert_eq!(report.counts.new, 3);
        let merged: Vec<String> = report.succeeded.iter().map(|p| p.to_string()).collect();
        assert_eq!(merged, ["dev-libs/a-1", "dev-libs/b-1", "app-misc/top-1"]);
    }
}
