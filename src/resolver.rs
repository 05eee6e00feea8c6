//! The backtracking dependency resolver.
//!
//! [`Resolver::resolve`] runs resolution *attempts* until one succeeds or
//! the [`Backtracker`] runs out of alternatives. An attempt expands the root
//! atoms breadth-first into a [`DependencyGraph`], selecting one candidate
//! per atom, then checks the result (slot-operator rebuilds, sonames,
//! blockers, slot conflicts, REQUIRED_USE) and finally orders it. Failed
//! attempts report [`BacktrackInfo`] which the backtracker turns into masks
//! and configuration changes for the next attempt.
//!
//! All metadata access goes through a [`ResolverContext`], which also keeps
//! memoized candidate lists and parsed dependency strings for the lifetime
//! of the resolver.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use portage_atom::Cpn;
use tracing::{debug, info, trace, warn};

use crate::atom::{Blocker, Dep, DepExt, parse_atom};
use crate::backtrack::{BacktrackInfo, BacktrackParameter, Backtracker, ConfigChanges};
use crate::config::{Options, UseConfig};
use crate::depstring::{self, DepNode, FlagTerm};
use crate::error::{DepStringError, GraphError};
use crate::graph::{DependencyGraph, PackageId};
use crate::matcher::{atom_matches, atom_matches_ignoring_use, blocked_packages, use_mismatches};
use crate::merge_order::{MergeList, OrderError, OrderMode, merge_order, unmerge_order};
use crate::package::{CandidateKey, DepClass, MaskReason, Operation, Package, PackageMetadata, Provenance};
use crate::priority::Priority;
use crate::problem::{Problem, Resolution, Suggestion};
use crate::repository::PackageRepository;
use crate::tracker::PackageTracker;
use crate::version::PmsOrder;

/// A record available for selection.
#[derive(Debug, Clone)]
struct Candidate {
    meta: Arc<PackageMetadata>,
    provenance: Provenance,
}

impl Candidate {
    fn from_source(provenance: Provenance) -> impl Fn(PackageMetadata) -> Candidate {
        move |meta| Candidate {
            meta: Arc::new(meta),
            provenance,
        }
    }

    fn is(&self, key: &CandidateKey) -> bool {
        self.provenance == key.provenance
            && self.meta.cpv.cpn == key.cpn
            && self.meta.cpv.version == key.version
            && self.meta.repo == key.repo
    }
}

/// Dependency strings of one record, parsed once.
#[derive(Debug)]
struct ParsedDeps {
    classes: Vec<(DepClass, Result<Vec<DepNode<Dep>>, DepStringError>)>,
    required_use: Result<Vec<DepNode<FlagTerm>>, DepStringError>,
}

impl ParsedDeps {
    fn parse(meta: &PackageMetadata) -> Self {
        Self {
            classes: meta
                .dependencies
                .iter_classes()
                .map(|(class, s)| (class, depstring::parse_dependencies(s)))
                .collect(),
            required_use: depstring::parse_required_use(&meta.required_use),
        }
    }
}

enum Visibility {
    Visible,
    KeywordMasked(String),
    Masked(String),
}

/// Everything a resolution run reads: the package databases, options, USE
/// policy and memoized lookups.
pub struct ResolverContext<'a> {
    ebuilds: &'a dyn PackageRepository,
    installed: &'a dyn PackageRepository,
    binaries: Option<&'a dyn PackageRepository>,
    /// Resolution options.
    pub options: Options,
    /// USE flag and keyword policy.
    pub use_config: UseConfig,
    candidates: HashMap<Cpn, Arc<[Candidate]>>,
    parsed: HashMap<CandidateKey, Arc<ParsedDeps>>,
    installed_pkgs: Option<Arc<[Package]>>,
}

impl<'a> ResolverContext<'a> {
    /// A context over an ebuild repository and the installed-package
    /// database, with default options.
    pub fn new(ebuilds: &'a dyn PackageRepository, installed: &'a dyn PackageRepository) -> Self {
        Self {
            ebuilds,
            installed,
            binaries: None,
            options: Options::default(),
            use_config: UseConfig::default(),
            candidates: HashMap::new(),
            parsed: HashMap::new(),
            installed_pkgs: None,
        }
    }

    /// Add a binary package repository, consulted with `usepkg`.
    pub fn with_binaries(mut self, binaries: &'a dyn PackageRepository) -> Self {
        self.binaries = Some(binaries);
        self.candidates.clear();
        self
    }

    /// Replace the options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self.candidates.clear();
        self
    }

    /// Replace the USE policy.
    pub fn with_use_config(mut self, use_config: UseConfig) -> Self {
        self.use_config = use_config;
        self
    }

    /// Candidates for a name in preference order of their sources: ebuilds,
    /// binaries, then installed records.
    fn candidates(&mut self, cpn: &Cpn) -> Arc<[Candidate]> {
        if let Some(cached) = self.candidates.get(cpn) {
            return cached.clone();
        }
        let mut out = Vec::new();
        if !self.options.usepkgonly {
            out.extend(self.ebuilds.versions_for(cpn).into_iter().map(Candidate::from_source(Provenance::Ebuild)));
        }
        if let Some(binaries) = self.binaries.filter(|_| self.options.binaries_allowed()) {
            out.extend(binaries.versions_for(cpn).into_iter().map(Candidate::from_source(Provenance::Binary)));
        }
        out.extend(self.installed.versions_for(cpn).into_iter().map(Candidate::from_source(Provenance::Installed)));
        trace!(package = %cpn, candidates = out.len(), "loaded candidates");
        let out: Arc<[Candidate]> = out.into();
        self.candidates.insert(cpn.clone(), out.clone());
        out
    }

    fn parsed(&mut self, pkg: &Package) -> Arc<ParsedDeps> {
        self.parsed
            .entry(pkg.candidate_key())
            .or_insert_with(|| Arc::new(ParsedDeps::parse(pkg.metadata())))
            .clone()
    }

    fn installed_packages(&mut self) -> Arc<[Package]> {
        if let Some(pkgs) = &self.installed_pkgs {
            return pkgs.clone();
        }
        let pkgs: Arc<[Package]> = self
            .installed
            .all_packages()
            .iter()
            .flat_map(|cpn| self.installed.versions_for(cpn))
            .map(|meta| Package::installed(Arc::new(meta)))
            .collect();
        self.installed_pkgs = Some(pkgs.clone());
        pkgs
    }

    /// The package a candidate becomes under an attempt's parameter.
    fn package_for(&self, cand: &Candidate, param: &BacktrackParameter) -> Package {
        let meta = cand.meta.clone();
        match cand.provenance {
            Provenance::Installed => Package::installed(meta),
            Provenance::Binary => {
                let use_enabled = meta.use_flags.iter().cloned().collect();
                Package::new(meta, Provenance::Binary, Operation::Merge, use_enabled)
            }
            Provenance::Ebuild => {
                let base = Package::new(meta.clone(), Provenance::Ebuild, Operation::Merge, BTreeSet::new());
                let mut use_enabled = self.use_config.effective_use(&base);
                if let Some(flips) = param.needed_use_changes.get(&base.candidate_key()) {
                    for (flag, on) in flips {
                        if *on {
                            use_enabled.insert(flag.clone());
                        } else {
                            use_enabled.remove(flag);
                        }
                    }
                }
                Package::new(meta, Provenance::Ebuild, Operation::Merge, use_enabled)
            }
        }
    }

    fn visibility(&self, pkg: &Package, param: &BacktrackParameter) -> Visibility {
        if let Some(cause) = param.runtime_pkg_mask.get(&pkg.candidate_key()) {
            return Visibility::Masked(cause.to_string());
        }
        if pkg.is_installed() {
            return Visibility::Visible;
        }
        match &pkg.metadata().mask {
            None => Visibility::Visible,
            Some(MaskReason::Keyword(keyword)) => {
                if self.use_config.keyword_accepted(pkg)
                    || param.needed_unstable_keywords.contains(&pkg.candidate_key())
                {
                    Visibility::Visible
                } else {
                    Visibility::KeywordMasked(keyword.clone())
                }
            }
            Some(reason) => Visibility::Masked(reason.to_string()),
        }
    }

    /// Suggestions for the configuration changes a parameter assumes.
    fn suggestions_for(&mut self, param: &BacktrackParameter) -> Vec<Suggestion> {
        let mut out: Vec<Suggestion> = param
            .needed_use_changes
            .iter()
            .map(|(package, changes)| Suggestion::UseChange {
                package: package.clone(),
                changes: changes.clone(),
            })
            .collect();
        for key in &param.needed_unstable_keywords {
            let keyword = self
                .candidates(&key.cpn)
                .iter()
                .find(|c| c.is(key))
                .and_then(|c| match &c.meta.mask {
                    Some(MaskReason::Keyword(k)) => Some(k.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "**".to_string());
            out.push(Suggestion::AcceptKeyword {
                package: key.clone(),
                keyword,
            });
        }
        out
    }
}

/// Backtracking resolver over a [`ResolverContext`].
pub struct Resolver<'a> {
    ctx: ResolverContext<'a>,
    graph: DependencyGraph<Package>,
}

impl<'a> Resolver<'a> {
    /// Create a resolver.
    pub fn new(ctx: ResolverContext<'a>) -> Self {
        Self {
            ctx,
            graph: DependencyGraph::new(),
        }
    }

    /// The context the resolver reads from.
    pub fn context(&self) -> &ResolverContext<'a> {
        &self.ctx
    }

    /// Resolve root atoms into a merge list.
    ///
    /// On failure the attempt with the fewest problems is reported; the
    /// earliest one wins ties.
    pub fn resolve(&mut self, atoms: &[Dep]) -> Resolution {
        let mut backtracker = Backtracker::new(self.ctx.options.backtrack);
        let base = self.graph.checkpoint();
        let mut best: Option<Resolution> = None;

        while let Some(param) = backtracker.next_parameter() {
            let attempt = backtracker.attempts();
            self.graph.rewind(base);
            debug!(
                attempt,
                masks = param.runtime_pkg_mask.len(),
                use_changes = param.needed_use_changes.len(),
                keywords = param.needed_unstable_keywords.len(),
                "starting resolution attempt"
            );

            let outcome = Attempt::new(&mut self.ctx, &param, &mut self.graph).run(atoms);
            let mut suggestions = self.ctx.suggestions_for(&param);

            if outcome.is_success() {
                info!(attempt, steps = outcome.merge_list.as_ref().map_or(0, MergeList::len), "resolution succeeded");
                return Resolution {
                    merge_list: outcome.merge_list,
                    problems: Vec::new(),
                    suggestions,
                    graph: self.graph.clone(),
                    attempts: attempt,
                };
            }

            for s in &outcome.suggestions {
                if !suggestions.contains(s) {
                    suggestions.push(s.clone());
                }
            }
            debug!(attempt, problems = outcome.problems.len(), infos = outcome.infos.len(), "attempt failed");
            if best.as_ref().is_none_or(|b| outcome.problems.len() < b.problems.len()) {
                best = Some(Resolution {
                    merge_list: outcome.merge_list,
                    problems: outcome.problems,
                    suggestions,
                    graph: self.graph.clone(),
                    attempts: attempt,
                });
            }

            if param.has_config_changes() && !self.ctx.options.autounmask_backtrack {
                debug!("not backtracking past a run that needs configuration changes");
                break;
            }
            backtracker.feedback(outcome.infos);
        }

        let mut resolution = best.unwrap_or_default();
        if resolution.suggestions.is_empty() {
            let fallback = backtracker.best_config_run();
            resolution.suggestions = self.ctx.suggestions_for(&fallback);
        }
        resolution.attempts = backtracker.attempts();
        warn!(
            attempts = resolution.attempts,
            problems = resolution.problems.len(),
            "resolution failed"
        );
        resolution
    }

    /// Parse command-line atoms and resolve the valid ones; the invalid ones
    /// are reported as [`Problem::InvalidAtom`].
    pub fn resolve_args(&mut self, args: &[&str]) -> Resolution {
        let mut atoms = Vec::with_capacity(args.len());
        let mut invalid = Vec::new();
        for arg in args {
            match parse_atom(arg) {
                Ok(atom) => atoms.push(atom),
                Err(error) => {
                    warn!(atom = %arg, %error, "ignoring invalid atom");
                    invalid.push(Problem::InvalidAtom {
                        atom: arg.to_string(),
                        error,
                    });
                }
            }
        }
        let mut resolution = self.resolve(&atoms);
        resolution.problems.extend(invalid);
        resolution
    }

    /// Order the removal of every installed package matching `atoms`.
    ///
    /// Packages are removed before the packages they depend on; build-time
    /// edges are the first to be ignored and install-time edges never are.
    pub fn plan_removal(&mut self, atoms: &[Dep]) -> Resolution {
        let installed = self.ctx.installed_packages();
        let mut problems = Vec::new();
        let mut targets: Vec<Package> = Vec::new();
        for atom in atoms {
            let hits: Vec<&Package> = installed.iter().filter(|p| atom_matches(atom, p, None)).collect();
            if hits.is_empty() {
                problems.push(Problem::UnsatisfiableDependency {
                    atom: atom.clone(),
                    parent: None,
                    masked: Vec::new(),
                });
            }
            for pkg in hits {
                if !targets.contains(pkg) {
                    targets.push(pkg.clone());
                }
            }
        }

        let mut graph = DependencyGraph::new();
        let ids: Vec<(PackageId, Package)> = targets
            .iter()
            .map(|p| (graph.add_node(p.with_operation(Operation::Uninstall)), p.clone()))
            .collect();
        for (pid, parent) in &ids {
            let parsed = self.ctx.parsed(parent);
            for (class, nodes) in &parsed.classes {
                let nodes = match nodes {
                    Ok(nodes) => nodes,
                    Err(error) => {
                        problems.push(Problem::InvalidDependString {
                            package: parent.clone(),
                            class: *class,
                            error: error.clone(),
                        });
                        continue;
                    }
                };
                let reduced = depstring::reduce(nodes, &|f| parent.is_enabled(f));
                for atom in depstring::leaves(&reduced) {
                    if atom.is_blocker() {
                        continue;
                    }
                    for (cid, child) in &ids {
                        if cid == pid || !atom_matches(atom, child, Some(parent)) {
                            continue;
                        }
                        if let Err(error) = graph.add_edge(*pid, *cid, edge_priority(*class, atom)) {
                            problems.push(Problem::Internal { error });
                        }
                    }
                }
            }
        }

        let merge_list = match unmerge_order(&graph, OrderMode::Strict) {
            Ok(list) => Some(list),
            Err(OrderError::CircularDependency { cycle }) => {
                problems.push(Problem::CircularDependency {
                    cycle,
                    suggestions: Vec::new(),
                });
                None
            }
            Err(OrderError::Graph(error)) => {
                problems.push(Problem::Internal { error });
                None
            }
        };
        info!(packages = ids.len(), problems = problems.len(), "removal planned");
        Resolution {
            merge_list: merge_list.filter(|_| problems.is_empty()),
            problems,
            suggestions: Vec::new(),
            graph,
            attempts: 1,
        }
    }
}

/// Edge priority for a dependency class.
fn edge_priority(class: DepClass, atom: &Dep) -> Priority {
    let slot_op = atom.has_slot_equal_op();
    match class {
        DepClass::Depend | DepClass::Bdepend if slot_op => Priority::buildtime_slot_op(),
        DepClass::Depend | DepClass::Bdepend => Priority::buildtime(),
        DepClass::Rdepend if slot_op => Priority::runtime_slot_op(),
        DepClass::Rdepend => Priority::runtime(),
        DepClass::Pdepend => Priority::runtime_post(),
        DepClass::Idepend => Priority::installtime(),
    }
}

fn provenance_rank(provenance: Provenance) -> u8 {
    match provenance {
        Provenance::Ebuild => 0,
        Provenance::Binary => 1,
        Provenance::Installed => 2,
    }
}

#[derive(Debug, Clone)]
struct ParentAtom {
    parent: Option<PackageId>,
    atom: Dep,
    priority: Priority,
}

#[derive(Debug, Clone)]
struct WorkItem {
    parent: Option<PackageId>,
    atom: Dep,
    priority: Priority,
    depth: usize,
}

struct AttemptOutcome {
    merge_list: Option<MergeList>,
    problems: Vec<Problem>,
    infos: Vec<BacktrackInfo>,
    suggestions: Vec<Suggestion>,
}

impl AttemptOutcome {
    fn is_success(&self) -> bool {
        self.merge_list.is_some() && self.problems.is_empty() && self.infos.is_empty()
    }
}

/// State of a single resolution attempt.
struct Attempt<'c, 'a> {
    ctx: &'c mut ResolverContext<'a>,
    param: &'c BacktrackParameter,
    graph: &'c mut DependencyGraph<Package>,
    tracker: PackageTracker,
    roots: IndexSet<PackageId>,
    parent_atoms: IndexMap<PackageId, Vec<ParentAtom>>,
    depth: HashMap<PackageId, usize>,
    queue: VecDeque<WorkItem>,
    expanded: HashSet<PackageId>,
    blockers: Vec<(PackageId, Dep)>,
    rebuilt: HashSet<CandidateKey>,
    problems: Vec<Problem>,
    infos: Vec<BacktrackInfo>,
    config: ConfigChanges,
    suggestions: Vec<Suggestion>,
}

impl<'c, 'a> Attempt<'c, 'a> {
    fn new(
        ctx: &'c mut ResolverContext<'a>,
        param: &'c BacktrackParameter,
        graph: &'c mut DependencyGraph<Package>,
    ) -> Self {
        Self {
            ctx,
            param,
            graph,
            tracker: PackageTracker::new(),
            roots: IndexSet::new(),
            parent_atoms: IndexMap::new(),
            depth: HashMap::new(),
            queue: VecDeque::new(),
            expanded: HashSet::new(),
            blockers: Vec::new(),
            rebuilt: HashSet::new(),
            problems: Vec::new(),
            infos: Vec::new(),
            config: ConfigChanges::default(),
            suggestions: Vec::new(),
        }
    }

    fn run(mut self, atoms: &[Dep]) -> AttemptOutcome {
        for pkg in self.ctx.installed_packages().iter() {
            self.tracker.add_installed(pkg.clone());
        }
        for atom in atoms {
            if atom.is_blocker() {
                warn!(%atom, "ignoring blocker given as a root atom");
                continue;
            }
            self.queue.push_back(WorkItem {
                parent: None,
                atom: atom.clone(),
                priority: Priority::default(),
                depth: 0,
            });
        }

        self.drain();
        self.slot_operator_rebuilds();
        self.prune_orphans();
        if !self.ctx.options.ignore_soname_deps {
            self.link_sonames();
        }
        self.check_blockers();
        self.check_slot_conflicts();
        self.check_required_use();

        if !self.config.is_empty() {
            let changes = std::mem::take(&mut self.config);
            self.infos.push(BacktrackInfo::Config(changes));
        }
        let merge_list = if self.problems.is_empty() && self.infos.is_empty() {
            self.order()
        } else {
            None
        };
        AttemptOutcome {
            merge_list,
            problems: self.problems,
            infos: self.infos,
            suggestions: self.suggestions,
        }
    }

    fn drain(&mut self) {
        while let Some(item) = self.queue.pop_front() {
            self.resolve_item(item);
        }
    }

    fn resolve_item(&mut self, item: WorkItem) {
        let parent = match item.parent {
            Some(id) => match self.graph.node(id) {
                Some(p) => Some(p.clone()),
                // The parent was replaced; its replacement re-queues its own deps.
                None => return,
            },
            None => None,
        };
        trace!(atom = %item.atom, depth = item.depth, "resolving");

        let selected = self.tracker.match_selected(&item.atom, parent.as_ref());
        if let Some(existing) = selected.iter().find_map(|p| self.graph.id_of(p)) {
            self.link(item.parent, existing, &item.atom, item.priority);
            return;
        }
        if let Some(pkg) = self.select_candidate(&item, parent.as_ref()) {
            self.add_selection(pkg, &item);
        }
    }

    /// Pick the best candidate for an atom, or record why there is none.
    fn select_candidate(&mut self, item: &WorkItem, parent: Option<&Package>) -> Option<Package> {
        let atom = &item.atom;
        let candidates = self.ctx.candidates(&atom.cpn);
        let mut visible: Vec<(usize, Package)> = Vec::new();
        let mut keyword_masked: Vec<(usize, Package, String)> = Vec::new();
        let mut masked: Vec<(CandidateKey, String)> = Vec::new();
        for (order, cand) in candidates.iter().enumerate() {
            let pkg = self.ctx.package_for(cand, self.param);
            if !atom_matches_ignoring_use(atom, &pkg) {
                continue;
            }
            match self.ctx.visibility(&pkg, self.param) {
                Visibility::Visible => visible.push((order, pkg)),
                Visibility::KeywordMasked(keyword) => {
                    masked.push((pkg.candidate_key(), MaskReason::Keyword(keyword.clone()).to_string()));
                    keyword_masked.push((order, pkg, keyword));
                }
                Visibility::Masked(reason) => masked.push((pkg.candidate_key(), reason)),
            }
        }

        let matching: Vec<(usize, Package)> = visible
            .iter()
            .filter(|(_, p)| use_mismatches(atom, p, parent).is_empty())
            .cloned()
            .collect();
        if let Some(best) = self.best_candidate(&matching, item.depth) {
            return Some(best);
        }

        if self.ctx.options.autounmask {
            let fixable: Vec<(usize, Package)> = visible
                .iter()
                .filter(|(_, p)| {
                    let missing = use_mismatches(atom, p, parent);
                    !missing.is_empty() && missing.iter().all(|m| m.changeable)
                })
                .cloned()
                .collect();
            if let Some(best) = self.best_candidate(&fixable, item.depth) {
                let changes: BTreeMap<String, bool> = use_mismatches(atom, &best, parent)
                    .into_iter()
                    .map(|m| (m.flag, m.enabled))
                    .collect();
                debug!(package = %best, %atom, "USE change needed");
                self.request_use_change(&best, changes);
                return None;
            }

            if !self.ctx.options.autounmask_use_only {
                let unmaskable: Vec<(usize, Package)> = keyword_masked
                    .iter()
                    .filter(|(_, p, _)| use_mismatches(atom, p, parent).is_empty())
                    .map(|(order, p, _)| (*order, p.clone()))
                    .collect();
                if let Some(best) = self.best_candidate(&unmaskable, item.depth) {
                    let keyword = keyword_masked
                        .iter()
                        .find(|(_, p, _)| *p == best)
                        .map(|(_, _, k)| k.clone())
                        .unwrap_or_default();
                    debug!(package = %best, %keyword, "keyword change needed");
                    self.config.unstable_keywords.push(best.candidate_key());
                    let suggestion = Suggestion::AcceptKeyword {
                        package: best.candidate_key(),
                        keyword,
                    };
                    if !self.suggestions.contains(&suggestion) {
                        self.suggestions.push(suggestion);
                    }
                    return None;
                }
            }
        }

        debug!(%atom, parent = ?parent.map(Package::to_string), "unsatisfiable dependency");
        if let Some(p) = parent.filter(|p| p.is_merge()) {
            self.infos.push(BacktrackInfo::MissingDependency {
                parent: p.candidate_key(),
                atom: atom.clone(),
            });
        }
        self.problems.push(Problem::UnsatisfiableDependency {
            atom: atom.clone(),
            parent: parent.cloned(),
            masked,
        });
        None
    }

    /// Rank candidates: valid REQUIRED_USE, then keeping what is installed
    /// (unless updating), version, provenance, fewest new slot conflicts and
    /// finally source order.
    fn best_candidate(&mut self, candidates: &[(usize, Package)], depth: usize) -> Option<Package> {
        let update = self.ctx.options.update && (depth == 0 || self.ctx.options.deep);
        let mut best = None;
        for (order, pkg) in candidates {
            let conflicts = self
                .tracker
                .selected_in(&pkg.slot_key())
                .iter()
                .filter(|p| *p != pkg)
                .count();
            let key = (
                self.required_use_ok(pkg),
                pkg.is_installed() && !update,
                PmsOrder(pkg.version()),
                provenance_rank(pkg.provenance()),
                Reverse(conflicts),
                Reverse(*order),
            );
            if best.as_ref().is_none_or(|(k, _)| key > *k) {
                best = Some((key, pkg));
            }
        }
        best.map(|(_, pkg)| pkg.clone())
    }

    fn required_use_ok(&mut self, pkg: &Package) -> bool {
        if pkg.provenance() != Provenance::Ebuild {
            return true;
        }
        match &self.ctx.parsed(pkg).required_use {
            Ok(nodes) => depstring::required_use_satisfied(nodes, &|f| pkg.is_enabled(f)),
            Err(_) => false,
        }
    }

    fn request_use_change(&mut self, pkg: &Package, changes: BTreeMap<String, bool>) {
        let key = pkg.candidate_key();
        self.config.use_changes.push((key.clone(), changes.clone()));
        let suggestion = Suggestion::UseChange { package: key, changes };
        if !self.suggestions.contains(&suggestion) {
            self.suggestions.push(suggestion);
        }
    }

    fn add_selection(&mut self, pkg: Package, item: &WorkItem) {
        let rivals: Vec<Package> = self
            .tracker
            .selected_in(&pkg.slot_key())
            .iter()
            .filter(|p| **p != pkg)
            .cloned()
            .collect();
        let id = self.graph.add_node(pkg.clone());
        self.tracker.select(pkg.clone());
        self.depth.insert(id, item.depth);
        self.link(item.parent, id, &item.atom, item.priority);

        // Take over a slot when every atom that pulled the rival in also
        // accepts the new package.
        for rival in rivals {
            let Some(rival_id) = self.graph.id_of(&rival) else {
                continue;
            };
            let accepted = self.parent_atoms.get(&rival_id).is_none_or(|atoms| {
                atoms.iter().all(|pa| {
                    let parent = pa.parent.and_then(|p| self.graph.node(p));
                    atom_matches(&pa.atom, &pkg, parent)
                })
            });
            if accepted {
                debug!(old = %rival, new = %pkg, "replacing slot selection");
                self.replace(rival_id, id);
            }
        }
        self.expand(id, item.depth);
    }

    fn link(&mut self, parent: Option<PackageId>, child: PackageId, atom: &Dep, priority: Priority) {
        let atoms = self.parent_atoms.entry(child).or_default();
        if !atoms.iter().any(|pa| pa.parent == parent && pa.atom == *atom) {
            atoms.push(ParentAtom {
                parent,
                atom: atom.clone(),
                priority,
            });
        }
        let Some(parent) = parent else {
            self.roots.insert(child);
            return;
        };
        let satisfied = self.graph.node(child).is_some_and(|c| !c.is_merge());
        match self.graph.add_edge(parent, child, priority.with_satisfied(satisfied)) {
            Ok(_) => {}
            Err(GraphError::SelfLoop(id)) => {
                warn!(node = %id, %atom, "package depends on itself");
            }
            Err(error) => self.problems.push(Problem::Internal { error }),
        }
    }

    /// Move every parent of `old` over to `new` and drop `old`.
    fn replace(&mut self, old: PackageId, new: PackageId) {
        let moved = self.parent_atoms.shift_remove(&old).unwrap_or_default();
        for pa in moved {
            if pa.parent == Some(new) {
                continue;
            }
            self.link(pa.parent, new, &pa.atom, pa.priority);
        }
        if self.roots.shift_remove(&old) {
            self.roots.insert(new);
        }
        if let Some(pkg) = self.graph.remove_node(old) {
            self.tracker.deselect(&pkg);
        }
        self.expanded.remove(&old);
    }

    fn expand(&mut self, id: PackageId, depth: usize) {
        if !self.expanded.insert(id) {
            return;
        }
        let Some(pkg) = self.graph.node(id).cloned() else {
            return;
        };
        if !pkg.is_merge() && depth > 0 && !self.ctx.options.deep {
            trace!(package = %pkg, "not descending into installed package");
            return;
        }

        let parsed = self.ctx.parsed(&pkg);
        for (class, nodes) in &parsed.classes {
            let buildtime = class.is_buildtime();
            match pkg.provenance() {
                Provenance::Binary if buildtime => continue,
                Provenance::Installed if buildtime && !self.ctx.options.with_bdeps => continue,
                _ => {}
            }
            let nodes = match nodes {
                Ok(nodes) => nodes,
                Err(error) => {
                    warn!(package = %pkg, %class, %error, "invalid dependency string");
                    self.problems.push(Problem::InvalidDependString {
                        package: pkg.clone(),
                        class: *class,
                        error: error.clone(),
                    });
                    continue;
                }
            };
            let reduced = depstring::reduce(nodes, &|f| pkg.is_enabled(f));
            let mut atoms = Vec::new();
            self.collect_atoms(&reduced, &pkg, &mut atoms);
            for atom in atoms {
                if atom.is_blocker() {
                    if !self.blockers.iter().any(|(o, b)| *o == id && *b == atom) {
                        self.blockers.push((id, atom));
                    }
                    continue;
                }
                let priority = if pkg.is_installed() && buildtime {
                    Priority::optional()
                } else {
                    edge_priority(*class, &atom)
                };
                self.queue.push_back(WorkItem {
                    parent: Some(id),
                    atom,
                    priority,
                    depth: depth + 1,
                });
            }
        }
    }

    /// Flatten a reduced tree into atoms, committing to one branch per
    /// choice group.
    fn collect_atoms(&mut self, nodes: &[DepNode<Dep>], parent: &Package, out: &mut Vec<Dep>) {
        for node in nodes {
            match node {
                DepNode::Leaf(atom) => out.push(atom.clone()),
                DepNode::AllOf(children) | DepNode::UseConditional { children, .. } => {
                    self.collect_atoms(children, parent, out)
                }
                DepNode::AnyOf(children) | DepNode::ExactlyOneOf(children) | DepNode::AtMostOneOf(children) => {
                    if let Some(branch) = self.choose_branch(children, parent) {
                        self.collect_atoms(std::slice::from_ref(branch), parent, out);
                    }
                }
            }
        }
    }

    /// Branch preference: already selected, then installed, then available,
    /// then simply the first one.
    fn choose_branch<'n>(&mut self, children: &'n [DepNode<Dep>], parent: &Package) -> Option<&'n DepNode<Dep>> {
        let wanted = |node: &'n DepNode<Dep>| -> Vec<&'n Dep> {
            depstring::leaves(std::slice::from_ref(node))
                .into_iter()
                .filter(|a| !a.is_blocker())
                .collect()
        };
        if let Some(branch) = children.iter().find(|c| {
            wanted(*c)
                .iter()
                .all(|a| !self.tracker.match_selected(a, Some(parent)).is_empty())
        }) {
            return Some(branch);
        }
        if let Some(branch) = children.iter().find(|c| {
            wanted(*c)
                .iter()
                .all(|a| !self.tracker.match_installed(a, Some(parent)).is_empty())
        }) {
            return Some(branch);
        }
        for branch in children {
            if wanted(branch).iter().all(|a| self.has_visible_candidate(a, parent)) {
                return Some(branch);
            }
        }
        children.first()
    }

    fn has_visible_candidate(&mut self, atom: &Dep, parent: &Package) -> bool {
        let candidates = self.ctx.candidates(&atom.cpn);
        candidates.iter().any(|cand| {
            let pkg = self.ctx.package_for(cand, self.param);
            atom_matches(atom, &pkg, Some(parent))
                && matches!(self.ctx.visibility(&pkg, self.param), Visibility::Visible)
        })
    }

    /// Rebuild installed packages whose `:=` dependency is being replaced
    /// by something they were not built against.
    fn slot_operator_rebuilds(&mut self) {
        while let Some((id, installed)) = self.find_rebuild() {
            self.rebuilt.insert(installed.candidate_key());
            let candidates = self.ctx.candidates(installed.cpn());
            let replacement = candidates
                .iter()
                .filter(|c| c.provenance == Provenance::Ebuild && c.meta.cpv == *installed.cpv())
                .map(|c| self.ctx.package_for(c, self.param))
                .find(|p| matches!(self.ctx.visibility(p, self.param), Visibility::Visible));
            let Some(pkg) = replacement else {
                debug!(package = %installed, "no ebuild available for slot-operator rebuild");
                continue;
            };
            info!(package = %pkg, "slot-operator rebuild");
            let depth = self.depth.get(&id).copied().unwrap_or(0);
            let new_id = self.graph.add_node(pkg.clone());
            self.tracker.select(pkg);
            self.depth.insert(new_id, depth);
            self.replace(id, new_id);
            self.expand(new_id, depth);
            self.drain();
        }
    }

    fn find_rebuild(&self) -> Option<(PackageId, Package)> {
        for (child_id, atoms) in &self.parent_atoms {
            let Some(child) = self.graph.node(*child_id).filter(|c| c.is_merge()) else {
                continue;
            };
            let Some(old) = self.tracker.installed_in(&child.slot_key()) else {
                continue;
            };
            for pa in atoms.iter().filter(|pa| pa.atom.has_slot_equal_op()) {
                let Some(parent_id) = pa.parent else {
                    continue;
                };
                let Some(parent) = self.graph.node(parent_id) else {
                    continue;
                };
                if !parent.is_installed() || self.rebuilt.contains(&parent.candidate_key()) {
                    continue;
                }
                if old.subslot() != child.subslot() || !atom_matches(&pa.atom, old, Some(parent)) {
                    return Some((parent_id, parent.clone()));
                }
            }
        }
        None
    }

    fn prune_orphans(&mut self) {
        loop {
            let orphans: Vec<PackageId> = self
                .graph
                .ids()
                .filter(|id| !self.roots.contains(id) && self.graph.predecessors(*id).is_empty())
                .collect();
            if orphans.is_empty() {
                break;
            }
            for id in orphans {
                if let Some(pkg) = self.graph.remove_node(id) {
                    trace!(package = %pkg, "pruning unreferenced package");
                    self.tracker.deselect(&pkg);
                }
                self.parent_atoms.shift_remove(&id);
            }
        }
    }

    fn link_sonames(&mut self) {
        let nodes: Vec<(PackageId, Package)> = self.graph.nodes().map(|(id, p)| (id, p.clone())).collect();
        for (id, pkg) in &nodes {
            if pkg.operation() == Operation::Uninstall {
                continue;
            }
            for soname in &pkg.metadata().requires {
                if pkg.metadata().provides.contains(soname) {
                    continue;
                }
                let in_graph = nodes
                    .iter()
                    .find(|(pid, p)| pid != id && p.operation() != Operation::Uninstall && p.metadata().provides.contains(soname))
                    .map(|(pid, _)| *pid);
                let provider = in_graph.or_else(|| {
                    let installed = self
                        .tracker
                        .installed()
                        .find(|p| !self.tracker.is_covered(p) && p.metadata().provides.contains(soname))
                        .cloned()?;
                    self.tracker.select(installed.clone());
                    Some(self.graph.add_node(installed))
                });
                match provider {
                    Some(child) => {
                        let satisfied = self.graph.node(child).is_some_and(|c| !c.is_merge());
                        if let Err(error) = self.graph.add_edge(*id, child, Priority::runtime().with_satisfied(satisfied)) {
                            self.problems.push(Problem::Internal { error });
                        }
                    }
                    None if pkg.is_merge() => {
                        debug!(package = %pkg, %soname, "no soname provider");
                        self.problems.push(Problem::UnsatisfiedSoname {
                            package: pkg.clone(),
                            soname: soname.clone(),
                        });
                    }
                    None => {}
                }
            }
        }
    }

    fn parent_keys(&self, id: PackageId) -> Vec<CandidateKey> {
        let mut keys = Vec::new();
        for pa in self.parent_atoms.get(&id).into_iter().flatten() {
            if let Some(p) = pa.parent.and_then(|p| self.graph.node(p)) {
                let key = p.candidate_key();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    fn check_blockers(&mut self) {
        let blockers = self.blockers.clone();
        let mut seen: HashSet<(CandidateKey, CandidateKey)> = HashSet::new();
        for (owner_id, blocker) in blockers {
            let Some(owner) = self.graph.node(owner_id).cloned() else {
                continue;
            };
            let planned: Vec<Package> = self
                .graph
                .nodes()
                .filter(|(_, p)| p.operation() != Operation::Uninstall)
                .map(|(_, p)| p.clone())
                .collect();
            let mut conflicting = Vec::new();
            for blocked in blocked_packages(&blocker, &planned, Some(&owner)) {
                if !owner.is_merge() && !blocked.is_merge() {
                    continue;
                }
                let pair = (owner.candidate_key(), blocked.candidate_key());
                let reverse = (pair.1.clone(), pair.0.clone());
                if seen.contains(&reverse) || !seen.insert(pair) {
                    continue;
                }
                if blocked.cpn() == owner.cpn() && blocked.slot() != owner.slot() {
                    let blocked_id = self.graph.id_of(&blocked);
                    debug!(owner = %owner, blocked = %blocked, "slots of one package block each other");
                    self.infos.push(BacktrackInfo::SlotConflict {
                        candidates: vec![
                            (owner.candidate_key(), self.parent_keys(owner_id)),
                            (blocked.candidate_key(), blocked_id.map(|b| self.parent_keys(b)).unwrap_or_default()),
                        ],
                    });
                    self.problems.push(Problem::SlotConflict {
                        slot: owner.slot_key(),
                        packages: vec![owner.clone(), blocked],
                    });
                } else {
                    conflicting.push(blocked);
                }
            }

            if owner.is_merge() {
                let installed: Vec<Package> = self
                    .tracker
                    .installed()
                    .filter(|p| !self.tracker.is_covered(p) && self.graph.id_of(p).is_none())
                    .cloned()
                    .collect();
                for blocked in blocked_packages(&blocker, &installed, Some(&owner)) {
                    if blocker.blocker == Some(Blocker::Weak) {
                        self.schedule_uninstall(owner_id, &blocked);
                    } else {
                        conflicting.push(blocked);
                    }
                }
            }

            if !conflicting.is_empty() {
                debug!(owner = %owner, %blocker, "blocker conflict");
                self.problems.push(Problem::BlockerConflict {
                    blocker,
                    parent: owner,
                    blocked: conflicting,
                });
            }
        }
    }

    /// Remove a weakly blocked installed package before its blocker merges.
    fn schedule_uninstall(&mut self, owner: PackageId, installed: &Package) {
        debug!(package = %installed, "scheduling uninstall of blocked package");
        let id = self.graph.add_node(installed.with_operation(Operation::Uninstall));
        self.tracker.remove_installed(installed);
        if let Err(error) = self.graph.add_edge(owner, id, Priority::installtime()) {
            self.problems.push(Problem::Internal { error });
        }
    }

    fn check_slot_conflicts(&mut self) {
        for (slot, packages) in self.tracker.slot_conflicts() {
            debug!(%slot, packages = packages.len(), "slot conflict");
            let candidates = packages
                .iter()
                .map(|p| {
                    let parents = self.graph.id_of(p).map(|id| self.parent_keys(id)).unwrap_or_default();
                    (p.candidate_key(), parents)
                })
                .collect();
            self.infos.push(BacktrackInfo::SlotConflict { candidates });
            self.problems.push(Problem::SlotConflict { slot, packages });
        }
    }

    fn check_required_use(&mut self) {
        let builds: Vec<Package> = self
            .graph
            .nodes()
            .filter(|(_, p)| p.is_merge() && p.provenance() == Provenance::Ebuild)
            .map(|(_, p)| p.clone())
            .collect();
        for pkg in builds {
            let parsed = self.ctx.parsed(&pkg);
            let nodes = match &parsed.required_use {
                Ok(nodes) => nodes,
                Err(error) => {
                    self.problems.push(Problem::InvalidRequiredUse {
                        package: pkg.clone(),
                        error: error.clone(),
                    });
                    continue;
                }
            };
            let enabled = |f: &str| pkg.is_enabled(f);
            if depstring::required_use_satisfied(nodes, &enabled) {
                continue;
            }
            if self.ctx.options.autounmask {
                let changeable: BTreeSet<String> = pkg.metadata().iuse_flags().map(str::to_string).collect();
                if let Some(changes) = depstring::suggest_required_use_fix(nodes, pkg.use_enabled(), &changeable) {
                    debug!(package = %pkg, "REQUIRED_USE needs a USE change");
                    self.request_use_change(&pkg, changes);
                    continue;
                }
            }
            self.problems.push(Problem::RequiredUseUnsatisfied {
                package: pkg.clone(),
                required_use: pkg.metadata().required_use.clone(),
                clauses: depstring::unsatisfied_clauses(nodes, &enabled),
            });
        }
    }

    fn order(&mut self) -> Option<MergeList> {
        let tracker = &self.tracker;
        let result = merge_order(
            &*self.graph,
            |pkg: &Package| pkg.change_against(tracker.installed_in(&pkg.slot_key())),
            OrderMode::Strict,
        );
        match result {
            Ok(list) => Some(list),
            Err(OrderError::CircularDependency { cycle }) => {
                let suggestions = self.cycle_suggestions(&cycle);
                self.problems.push(Problem::CircularDependency { cycle, suggestions });
                None
            }
            Err(OrderError::Graph(error)) => {
                self.problems.push(Problem::Internal { error });
                None
            }
        }
    }

    /// USE changes that would drop an edge of a cycle: active conditional
    /// groups around the dependency on the next package.
    fn cycle_suggestions(&mut self, cycle: &[Package]) -> Vec<Suggestion> {
        let mut out = Vec::new();
        for (i, parent) in cycle.iter().enumerate() {
            let child = &cycle[(i + 1) % cycle.len()];
            if parent.provenance() != Provenance::Ebuild || !parent.is_merge() {
                continue;
            }
            let parsed = self.ctx.parsed(parent);
            for (_, nodes) in &parsed.classes {
                let Ok(nodes) = nodes else {
                    continue;
                };
                let pulls_child = |a: &Dep| !a.is_blocker() && atom_matches_ignoring_use(a, child);
                for (flag, negate) in depstring::enclosing_conditionals(nodes, &pulls_child) {
                    let active = parent.is_enabled(&flag) != negate;
                    if !active || !parent.metadata().has_iuse(&flag) {
                        continue;
                    }
                    let suggestion = Suggestion::UseChange {
                        package: parent.candidate_key(),
                        changes: BTreeMap::from([(flag, negate)]),
                    };
                    if !out.contains(&suggestion) {
                        out.push(suggestion);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use portage_atom::Cpv;

    use super::*;
    use crate::package::ChangeKind;
    use crate::repository::InMemoryRepository;

    fn pkg(cpv: &str, rdepend: &str) -> PackageMetadata {
        let mut m = PackageMetadata::new(Cpv::parse(cpv).unwrap());
        m.dependencies.rdepend = rdepend.into();
        m
    }

    fn atoms(list: &[&str]) -> Vec<Dep> {
        list.iter().map(|s| parse_atom(s).unwrap()).collect()
    }

    fn names(res: &Resolution) -> Vec<String> {
        res.merge_list
            .as_ref()
            .map(|l| l.packages().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }

    fn resolve(repo: &InMemoryRepository, installed: &InMemoryRepository, options: Options, roots: &[&str]) -> Resolution {
        let ctx = ResolverContext::new(repo, installed).with_options(options);
        Resolver::new(ctx).resolve(&atoms(roots))
    }

    #[test]
    fn picks_highest_visible_version() {
        let mut masked = pkg("dev-libs/foo-3", "");
        masked.mask = Some(MaskReason::PackageMask("broken".into()));
        let repo: InMemoryRepository = [
            pkg("app-misc/top-1", "dev-libs/foo"),
            pkg("dev-libs/foo-1", ""),
            pkg("dev-libs/foo-2", ""),
            masked,
        ]
        .into_iter()
        .collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["app-misc/top"]);
        assert!(res.is_success(), "{res}");
        assert_eq!(names(&res), ["dev-libs/foo-2", "app-misc/top-1"]);
    }

    #[test]
    fn keeps_installed_unless_updating() {
        let repo: InMemoryRepository = [pkg("dev-libs/foo-1", ""), pkg("dev-libs/foo-2", "")].into_iter().collect();
        let installed: InMemoryRepository = [pkg("dev-libs/foo-1", "")].into_iter().collect();

        let res = resolve(&repo, &installed, Options::default(), &["dev-libs/foo"]);
        assert!(res.is_success());
        assert!(res.merge_list.as_ref().is_some_and(MergeList::is_empty));

        let options = Options {
            update: true,
            ..Options::default()
        };
        let res = resolve(&repo, &installed, options, &["dev-libs/foo"]);
        let list = res.merge_list.expect("plan");
        assert_eq!(list.len(), 1);
        assert_eq!(list.steps[0].change, ChangeKind::Upgrade);
    }

    #[test]
    fn any_of_prefers_installed_branch() {
        let repo: InMemoryRepository = [
            pkg("app-misc/top-1", "|| ( dev-libs/a dev-libs/b )"),
            pkg("dev-libs/a-1", ""),
            pkg("dev-libs/b-1", ""),
        ]
        .into_iter()
        .collect();
        let installed: InMemoryRepository = [pkg("dev-libs/b-1", "")].into_iter().collect();
        let res = resolve(&repo, &installed, Options::default(), &["app-misc/top"]);
        assert!(res.is_success());
        assert_eq!(names(&res), ["app-misc/top-1"]);
        assert!(res.graph.nodes().any(|(_, p)| p.to_string() == "dev-libs/b-1" && p.is_installed()));
    }

    #[test]
    fn unsatisfiable_reports_mask_reason() {
        let mut foo = pkg("dev-libs/foo-2", "");
        foo.mask = Some(MaskReason::Keyword("~amd64".into()));
        let repo: InMemoryRepository = [pkg("app-misc/top-1", "dev-libs/foo"), foo].into_iter().collect();
        let options = Options {
            autounmask: false,
            ..Options::default()
        };
        let res = resolve(&repo, &InMemoryRepository::new(), options, &["app-misc/top"]);
        assert!(!res.is_success());
        match &res.problems[..] {
            [Problem::UnsatisfiableDependency { atom, parent, masked }] => {
                assert_eq!(atom.to_string(), "dev-libs/foo");
                assert_eq!(parent.as_ref().map(|p| p.to_string()).as_deref(), Some("app-misc/top-1"));
                assert_eq!(masked.len(), 1);
                assert!(masked[0].1.contains("~amd64"));
            }
            other => panic!("unexpected problems: {other:?}"),
        }
    }

    #[test]
    fn autounmask_accepts_keyword() {
        let mut foo = pkg("dev-libs/foo-2", "");
        foo.mask = Some(MaskReason::Keyword("~amd64".into()));
        let repo: InMemoryRepository = [pkg("app-misc/top-1", "dev-libs/foo"), foo].into_iter().collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["app-misc/top"]);
        assert!(res.needs_config_changes());
        assert!(res.problems.is_empty());
        assert_eq!(names(&res), ["dev-libs/foo-2", "app-misc/top-1"]);
        assert_eq!(res.suggestions.len(), 1);
        assert_eq!(res.suggestions[0].to_string(), "=dev-libs/foo-2 ~amd64");
    }

    #[test]
    fn autounmask_use_only_skips_keywords() {
        let mut foo = pkg("dev-libs/foo-2", "");
        foo.mask = Some(MaskReason::Keyword("~amd64".into()));
        let repo: InMemoryRepository = [pkg("app-misc/top-1", "dev-libs/foo"), foo].into_iter().collect();
        let options = Options {
            autounmask_use_only: true,
            ..Options::default()
        };
        let res = resolve(&repo, &InMemoryRepository::new(), options, &["app-misc/top"]);
        assert!(res.suggestions.is_empty());
        assert!(matches!(res.problems[..], [Problem::UnsatisfiableDependency { .. }]));
    }

    #[test]
    fn autounmask_use_dependency() {
        let mut curl = pkg("net-misc/curl-8", "");
        curl.iuse = vec!["ssl".into()];
        let repo: InMemoryRepository = [pkg("app-misc/top-1", "net-misc/curl[ssl]"), curl].into_iter().collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["app-misc/top"]);
        assert!(res.problems.is_empty(), "{res}");
        assert_eq!(res.suggestions.len(), 1);
        assert_eq!(res.suggestions[0].to_string(), "=net-misc/curl-8 ssl");
        let list = res.merge_list.expect("plan");
        assert!(list.steps[0].package.is_enabled("ssl"));
    }

    #[test]
    fn required_use_fix_is_suggested() {
        let mut foo = pkg("dev-libs/foo-1", "");
        foo.iuse = vec!["gtk".into(), "qt".into()];
        foo.required_use = "|| ( gtk qt )".into();
        let repo: InMemoryRepository = [foo].into_iter().collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["dev-libs/foo"]);
        assert!(res.problems.is_empty(), "{res}");
        assert_eq!(res.suggestions[0].to_string(), "=dev-libs/foo-1 gtk");

        let options = Options {
            autounmask: false,
            ..Options::default()
        };
        let res = resolve(&repo, &InMemoryRepository::new(), options, &["dev-libs/foo"]);
        assert!(matches!(res.problems[..], [Problem::RequiredUseUnsatisfied { .. }]));
    }

    #[test]
    fn slot_selection_is_replaced_when_acceptable() {
        let repo: InMemoryRepository = [
            pkg("app-misc/b-1", "dev-libs/foo"),
            pkg("app-misc/a-1", "=dev-libs/foo-1"),
            pkg("dev-libs/foo-1", ""),
            pkg("dev-libs/foo-2", ""),
        ]
        .into_iter()
        .collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["app-misc/b", "app-misc/a"]);
        assert!(res.is_success(), "{res}");
        assert_eq!(res.attempts, 1);
        let names = names(&res);
        assert!(names.contains(&"dev-libs/foo-1".to_string()));
        assert!(!names.contains(&"dev-libs/foo-2".to_string()));
    }

    fn conflicting_repo() -> InMemoryRepository {
        [
            pkg("app-misc/q-1", "<dev-libs/foo-2"),
            pkg("app-misc/p-1", "|| ( >=dev-libs/foo-2 app-misc/baz )"),
            pkg("app-misc/baz-1", ""),
            pkg("dev-libs/foo-1", ""),
            pkg("dev-libs/foo-2", ""),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn backtracking_masks_slot_conflict_loser() {
        let repo = conflicting_repo();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["app-misc/q", "app-misc/p"]);
        assert!(res.is_success(), "{res}");
        assert_eq!(res.attempts, 3);
        let names = names(&res);
        assert!(names.contains(&"app-misc/baz-1".to_string()));
        assert!(names.contains(&"dev-libs/foo-1".to_string()));
        assert!(!names.contains(&"dev-libs/foo-2".to_string()));
    }

    #[test]
    fn zero_backtrack_reports_conflict() {
        let repo = conflicting_repo();
        let options = Options {
            backtrack: 0,
            ..Options::default()
        };
        let res = resolve(&repo, &InMemoryRepository::new(), options, &["app-misc/q", "app-misc/p"]);
        assert_eq!(res.attempts, 1);
        assert!(matches!(res.problems[..], [Problem::SlotConflict { .. }]));
    }

    #[test]
    fn weak_blocker_uninstalls_first() {
        let repo: InMemoryRepository = [pkg("app-misc/new-1", "!app-misc/old")].into_iter().collect();
        let installed: InMemoryRepository = [pkg("app-misc/old-1", "")].into_iter().collect();
        let res = resolve(&repo, &installed, Options::default(), &["app-misc/new"]);
        assert!(res.is_success(), "{res}");
        let list = res.merge_list.expect("plan");
        assert_eq!(list.len(), 2);
        assert_eq!(list.steps[0].change, ChangeKind::Uninstall);
        assert_eq!(list.steps[0].package.to_string(), "app-misc/old-1");
        assert_eq!(list.steps[1].package.to_string(), "app-misc/new-1");
    }

    #[test]
    fn strong_blocker_conflicts() {
        let repo: InMemoryRepository = [pkg("app-misc/new-1", "!!app-misc/old")].into_iter().collect();
        let installed: InMemoryRepository = [pkg("app-misc/old-1", "")].into_iter().collect();
        let res = resolve(&repo, &installed, Options::default(), &["app-misc/new"]);
        assert!(matches!(res.problems[..], [Problem::BlockerConflict { .. }]));
    }

    #[test]
    fn invalid_dependency_string_is_localized() {
        let repo: InMemoryRepository = [pkg("app-misc/top-1", "|| dev-libs/foo"), pkg("dev-libs/foo-1", "")]
            .into_iter()
            .collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["app-misc/top"]);
        match &res.problems[..] {
            [Problem::InvalidDependString { package, class, .. }] => {
                assert_eq!(package.to_string(), "app-misc/top-1");
                assert_eq!(*class, DepClass::Rdepend);
            }
            other => panic!("unexpected problems: {other:?}"),
        }
    }

    #[test]
    fn invalid_arguments_are_reported() {
        let repo: InMemoryRepository = [pkg("dev-libs/foo-1", "")].into_iter().collect();
        let installed = InMemoryRepository::new();
        let mut resolver = Resolver::new(ResolverContext::new(&repo, &installed));
        let res = resolver.resolve_args(&["dev-libs/foo", ">=bad"]);
        assert_eq!(names(&res), ["dev-libs/foo-1"]);
        assert!(matches!(res.problems[..], [Problem::InvalidAtom { .. }]));
    }

    #[test]
    fn missing_soname_provider_is_reported() {
        let mut app = pkg("app-misc/app-1", "");
        app.requires = vec!["libfoo.so.1".into()];
        let repo: InMemoryRepository = [app].into_iter().collect();
        let options = Options {
            ignore_soname_deps: false,
            ..Options::default()
        };
        let res = resolve(&repo, &InMemoryRepository::new(), options.clone(), &["app-misc/app"]);
        assert!(matches!(&res.problems[..], [Problem::UnsatisfiedSoname { soname, .. }] if soname == "libfoo.so.1"));

        let mut lib = pkg("dev-libs/foo-1", "");
        lib.provides = vec!["libfoo.so.1".into()];
        let installed: InMemoryRepository = [lib].into_iter().collect();
        let res = resolve(&repo, &installed, options, &["app-misc/app"]);
        assert!(res.is_success(), "{res}");
    }

    #[test]
    fn cycle_suggests_disabling_conditional() {
        let mut a = pkg("dev-libs/a-1", "");
        a.dependencies.depend = "doc? ( dev-libs/b )".into();
        a.iuse = vec!["+doc".into()];
        let mut b = pkg("dev-libs/b-1", "");
        b.dependencies.depend = "dev-libs/a".into();
        let repo: InMemoryRepository = [a, b].into_iter().collect();
        let res = resolve(&repo, &InMemoryRepository::new(), Options::default(), &["dev-libs/a"]);
        match &res.problems[..] {
            [Problem::CircularDependency { cycle, suggestions }] => {
                assert_eq!(cycle.len(), 2);
                assert_eq!(suggestions.len(), 1);
                assert_eq!(suggestions[0].to_string(), "=dev-libs/a-1 -doc");
            }
            other => panic!("unexpected problems: {other:?}"),
        }
    }

    #[test]
    fn removal_removes_dependents_first() {
        let installed: InMemoryRepository = [pkg("dev-libs/lib-1", ""), pkg("app-misc/app-1", "dev-libs/lib")]
            .into_iter()
            .collect();
        let repo = InMemoryRepository::new();
        let mut resolver = Resolver::new(ResolverContext::new(&repo, &installed));
        let res = resolver.plan_removal(&atoms(&["dev-libs/lib", "app-misc/app"]));
        assert!(res.is_success(), "{res}");
        assert_eq!(names(&res), ["app-misc/app-1", "dev-libs/lib-1"]);
        assert!(res.merge_list.unwrap().steps.iter().all(|s| s.change == ChangeKind::Uninstall));
    }
}
