//! Turning a conflict-free dependency graph into a merge list.
//!
//! Only packages with work to do (merges and uninstalls) appear in the list.
//! Installed packages kept as they are still matter for ordering: a merge
//! reached through them is ordered as if it were a direct, already
//! satisfied dependency. Post-merge (PDEPEND) edges are reversed so the
//! dependency is merged after its parent.
//!
//! When the graph is cyclic, edges are severed one hardness level at a time
//! using [`SatisfiedRange`], always picking the softest edge of each cycle.
//! Among equally soft edges the most recently discovered one goes, so the
//! first-discovered dependency is kept.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::GraphError;
use crate::graph::{DependencyGraph, PackageId};
use crate::package::{ChangeKind, Operation, Package};
use crate::priority::{NormalRange, Priority, PriorityRange, SatisfiedRange, UnmergeRange};

const CYCLE_LIMIT: usize = 64;

/// Failure to order a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    /// Only hard edges remain in a cycle (or a package depends on itself).
    #[error("circular dependency: {}", .cycle.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" -> "))]
    CircularDependency {
        /// Packages of the cycle, in edge order.
        cycle: Vec<Package>,
    },
    /// The graph violated one of its invariants.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// What to do once only hard edges are left in a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderMode {
    /// Fail with [`OrderError::CircularDependency`].
    #[default]
    Strict,
    /// Break the edge anyway and flag it in [`MergeList::cycle_breaks`].
    Permissive,
}

/// One package operation of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStep {
    /// The package.
    pub package: Package,
    /// How the step relates to what is installed.
    pub change: ChangeKind,
    /// Indices of steps that must finish before this one starts.
    pub deps: Vec<usize>,
    /// Index of the parallel batch the step belongs to.
    pub batch: usize,
}

/// An ordering edge that had to be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleBreak {
    /// The depending package.
    pub parent: Package,
    /// The dependency that is no longer ordered before it.
    pub child: Package,
    /// Hardness of the severed edge.
    pub hardness: i8,
    /// The severed edge was a hard (build or install time) edge.
    pub hard: bool,
}

/// An ordered plan with parallel batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeList {
    /// Steps in a valid order; batches are contiguous.
    pub steps: Vec<MergeStep>,
    /// Step indices per batch. Steps within a batch never depend on each
    /// other.
    pub batches: Vec<Vec<usize>>,
    /// Edges severed to break cycles.
    pub cycle_breaks: Vec<CycleBreak>,
    /// Groups of packages whose mutual runtime dependencies were severed;
    /// they only work once every member is merged.
    pub runtime_cycles: Vec<Vec<Package>>,
}

impl MergeList {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Packages in plan order.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.steps.iter().map(|s| &s.package)
    }

    /// Bytes to fetch for the whole plan.
    pub fn download_size(&self) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.package.is_merge())
            .map(|s| s.package.metadata().download_size)
            .sum()
    }

    /// Whether any hard edge had to be broken.
    pub fn has_hard_breaks(&self) -> bool {
        self.cycle_breaks.iter().any(|b| b.hard)
    }

    /// Index of a package's step.
    pub fn position(&self, pkg: &Package) -> Option<usize> {
        self.steps.iter().position(|s| s.package == *pkg)
    }
}

/// Order merges and uninstalls of a resolved graph.
///
/// `classify` tells how each package relates to the installed system.
pub fn merge_order(
    graph: &DependencyGraph<Package>,
    classify: impl Fn(&Package) -> ChangeKind,
    mode: OrderMode,
) -> Result<MergeList, OrderError> {
    if let Some(&id) = graph.self_loops().first() {
        return Err(self_cycle(graph, id));
    }
    let ordering = collapse_nomerge(graph)?;
    let none = |ps: &[Priority]| NormalRange::ignore_edge(ps, NormalRange::NONE);
    order_graph::<SatisfiedRange>(ordering, &none, classify, mode)
}

/// Order removals: a package goes before the packages it depends on.
///
/// Build-time edges are irrelevant once installed and are ignored from the
/// start; install-time edges are never broken.
pub fn unmerge_order(graph: &DependencyGraph<Package>, mode: OrderMode) -> Result<MergeList, OrderError> {
    if let Some(&id) = graph.self_loops().first() {
        return Err(self_cycle(graph, id));
    }
    let mut ordering = DependencyGraph::new();
    for (_, pkg) in graph.nodes() {
        if pkg.operation() == Operation::Uninstall {
            ordering.add_node(pkg.clone());
        }
    }
    let mut edges: Vec<_> = graph.edges().collect();
    edges.sort_by_key(|e| e.seq);
    for edge in edges {
        let (Some(parent), Some(child)) = (graph.node(edge.parent), graph.node(edge.child)) else {
            continue;
        };
        let (Some(p), Some(c)) = (ordering.id_of(parent), ordering.id_of(child)) else {
            continue;
        };
        for priority in edge.priorities {
            ordering.add_edge(c, p, *priority)?;
        }
    }
    let soft = |ps: &[Priority]| UnmergeRange::ignore_edge(ps, UnmergeRange::SOFT);
    order_graph::<UnmergeRange>(ordering, &soft, |_| ChangeKind::Uninstall, mode)
}

fn self_cycle(graph: &DependencyGraph<Package>, id: PackageId) -> OrderError {
    match graph.node(id) {
        Some(pkg) => OrderError::CircularDependency {
            cycle: vec![pkg.clone()],
        },
        None => OrderError::Graph(GraphError::MissingNode(id)),
    }
}

/// Build the ordering graph over packages with work to do.
fn collapse_nomerge(graph: &DependencyGraph<Package>) -> Result<DependencyGraph<Package>, GraphError> {
    let has_work = |pkg: &Package| pkg.operation() != Operation::NoMerge;

    let mut ordering = DependencyGraph::new();
    for (_, pkg) in graph.nodes() {
        if has_work(pkg) {
            ordering.add_node(pkg.clone());
        }
    }

    let mut edges: Vec<_> = graph.edges().collect();
    edges.sort_by_key(|e| e.seq);
    for edge in edges {
        let (Some(pkg), Some(child_pkg)) = (graph.node(edge.parent), graph.node(edge.child)) else {
            return Err(GraphError::MissingNode(edge.child));
        };
        if !has_work(pkg) {
            continue;
        }
        let Some(from) = ordering.id_of(pkg) else {
            continue;
        };
        if let Some(to) = ordering.id_of(child_pkg) {
            add_ordering_edges(&mut ordering, from, to, edge.priorities)?;
            continue;
        }
        // Kept installed package: order merges below it as satisfied
        // dependencies of this one.
        let satisfied: Vec<Priority> = edge.priorities.iter().map(|p| p.with_satisfied(true)).collect();
        let mut seen = HashSet::from([edge.child]);
        let mut stack = vec![edge.child];
        while let Some(cur) = stack.pop() {
            for next in graph.successors(cur) {
                if !seen.insert(next) {
                    continue;
                }
                match graph.node(next).and_then(|p| ordering.id_of(p)) {
                    Some(to) if to != from => add_ordering_edges(&mut ordering, from, to, &satisfied)?,
                    Some(_) => {}
                    None => stack.push(next),
                }
            }
        }
    }
    Ok(ordering)
}

/// Add the edges for one dependency, reversing post-merge-only bundles.
fn add_ordering_edges(
    ordering: &mut DependencyGraph<Package>,
    parent: PackageId,
    child: PackageId,
    priorities: &[Priority],
) -> Result<(), GraphError> {
    let post_only = priorities.iter().all(|p| p.runtime_post && !p.runtime && !p.buildtime && !p.installtime);
    if post_only {
        for p in priorities {
            ordering.add_edge(child, parent, *p)?;
        }
    } else {
        for p in priorities.iter().filter(|p| !(p.runtime_post && !p.runtime)) {
            ordering.add_edge(parent, child, *p)?;
        }
    }
    Ok(())
}

fn order_graph<R: PriorityRange>(
    mut ordering: DependencyGraph<Package>,
    initial_ignore: &dyn Fn(&[Priority]) -> bool,
    classify: impl Fn(&Package) -> ChangeKind,
    mode: OrderMode,
) -> Result<MergeList, OrderError> {
    let mut breaks: Vec<CycleBreak> = Vec::new();
    let mut runtime_cycles: Vec<Vec<PackageId>> = Vec::new();

    let order = loop {
        match ordering.topological_order(initial_ignore) {
            Ok(order) => break order,
            Err(GraphError::CycleDetected { .. }) => {
                break_cycles::<R>(&mut ordering, initial_ignore, mode, &mut breaks, &mut runtime_cycles)?;
            }
            Err(e) => return Err(e.into()),
        }
    };

    // Longest-path levels: a step's batch is one past its deepest dependency.
    let mut level: HashMap<PackageId, usize> = HashMap::new();
    for &id in &order {
        let lvl = ordering
            .successors_where(id, initial_ignore)
            .iter()
            .filter_map(|c| level.get(c))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level.insert(id, lvl);
    }

    let mut sorted = order.clone();
    sorted.sort_by_key(|id| level.get(id).copied().unwrap_or(0));

    let position: HashMap<PackageId, usize> = sorted.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut steps = Vec::with_capacity(sorted.len());
    let mut batches: Vec<Vec<usize>> = Vec::new();
    for (i, &id) in sorted.iter().enumerate() {
        let Some(pkg) = ordering.node(id) else {
            return Err(GraphError::MissingNode(id).into());
        };
        let batch = level.get(&id).copied().unwrap_or(0);
        let mut deps: Vec<usize> = ordering
            .successors_where(id, initial_ignore)
            .iter()
            .filter_map(|c| position.get(c).copied())
            .collect();
        deps.sort_unstable();
        if batches.len() <= batch {
            batches.resize_with(batch + 1, Vec::new);
        }
        batches[batch].push(i);
        steps.push(MergeStep {
            package: pkg.clone(),
            change: classify(pkg),
            deps,
            batch,
        });
    }

    debug!(steps = steps.len(), batches = batches.len(), breaks = breaks.len(), "merge order computed");
    let runtime_cycles = runtime_cycles
        .iter()
        .map(|cycle| cycle.iter().filter_map(|id| ordering.node(*id).cloned()).collect())
        .collect();
    Ok(MergeList {
        steps,
        batches,
        cycle_breaks: breaks,
        runtime_cycles,
    })
}

fn break_cycles<R: PriorityRange>(
    ordering: &mut DependencyGraph<Package>,
    initial_ignore: &dyn Fn(&[Priority]) -> bool,
    mode: OrderMode,
    breaks: &mut Vec<CycleBreak>,
    runtime_cycles: &mut Vec<Vec<PackageId>>,
) -> Result<(), OrderError> {
    let cycles = ordering.find_cycles(initial_ignore, CYCLE_LIMIT);
    if cycles.is_empty() {
        return Err(GraphError::CycleDetected { cycle: Vec::new() }.into());
    }

    for level in R::levels() {
        let mut broke = false;
        for cycle in &cycles {
            let Some((parent, child, hardness)) = softest_edge::<R>(ordering, cycle) else {
                continue;
            };
            if hardness > level {
                continue;
            }
            record_break::<R>(ordering, parent, child, hardness, false, cycle, breaks, runtime_cycles);
            broke = true;
        }
        if broke {
            return Ok(());
        }
    }

    let first = &cycles[0];
    match mode {
        OrderMode::Strict => Err(OrderError::CircularDependency {
            cycle: first.iter().filter_map(|id| ordering.node(*id).cloned()).collect(),
        }),
        OrderMode::Permissive => {
            let Some((parent, child, hardness)) = softest_edge::<R>(ordering, first) else {
                return Err(GraphError::CycleDetected { cycle: first.clone() }.into());
            };
            warn!(
                parent = %label(ordering, parent),
                child = %label(ordering, child),
                "breaking hard dependency edge to resolve a cycle"
            );
            record_break::<R>(ordering, parent, child, hardness, true, first, breaks, runtime_cycles);
            Ok(())
        }
    }
}

fn label(ordering: &DependencyGraph<Package>, id: PackageId) -> String {
    ordering
        .node(id)
        .map(|p| p.to_string())
        .unwrap_or_else(|| id.to_string())
}

/// The softest edge of a cycle; the latest-discovered edge wins ties.
///
/// Returns `None` when an earlier break already opened the cycle.
fn softest_edge<R: PriorityRange>(ordering: &DependencyGraph<Package>, cycle: &[PackageId]) -> Option<(PackageId, PackageId, i8)> {
    let n = cycle.len();
    let mut edges = Vec::with_capacity(n);
    for i in 0..n {
        let (p, c) = (cycle[i], cycle[(i + 1) % n]);
        let edge = ordering.edge(p, c)?;
        edges.push((p, c, R::edge_hardness(edge.priorities), edge.seq));
    }
    edges
        .into_iter()
        .min_by(|a, b| a.2.cmp(&b.2).then(b.3.cmp(&a.3)))
        .map(|(p, c, h, _)| (p, c, h))
}

#[allow(clippy::too_many_arguments)]
fn record_break<R: PriorityRange>(
    ordering: &mut DependencyGraph<Package>,
    parent: PackageId,
    child: PackageId,
    hardness: i8,
    hard: bool,
    cycle: &[PackageId],
    breaks: &mut Vec<CycleBreak>,
    runtime_cycles: &mut Vec<Vec<PackageId>>,
) {
    let Some(priorities) = ordering.remove_edge(parent, child) else {
        return;
    };
    let (Some(p), Some(c)) = (ordering.node(parent).cloned(), ordering.node(child).cloned()) else {
        return;
    };
    debug!(parent = %p, child = %c, hardness, "breaking cycle edge");
    if priorities.iter().all(Priority::is_runtime_level) {
        runtime_cycles.push(cycle.to_vec());
    }
    breaks.push(CycleBreak {
        parent: p,
        child: c,
        hardness,
        hard: hard || R::edge_hardness(&priorities) >= R::HARD,
    });
}
