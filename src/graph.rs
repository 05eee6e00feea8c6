//! Arena-backed dependency multigraph.
//!
//! Nodes live in a central table and are addressed by [`PackageId`]; edges
//! point from a parent to the child it depends on and carry every
//! [`Priority`] under which the dependency was discovered. Iteration order is
//! insertion order everywhere, so every algorithm here is deterministic.
//!
//! Mutations are journaled. [`DependencyGraph::checkpoint`] marks a point in
//! the journal and [`DependencyGraph::rewind`] undoes everything after it,
//! which is how a resolution attempt discards provisional choices.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};

use crate::error::GraphError;
use crate::priority::Priority;

/// Index of a node in a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(u32);

impl PackageId {
    /// Position in the node table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct EdgeBundle {
    priorities: Vec<Priority>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct NodeEntry<N> {
    value: N,
    children: IndexMap<PackageId, EdgeBundle>,
    parents: IndexSet<PackageId>,
}

#[derive(Debug, Clone)]
enum Change<N> {
    AddNode(PackageId),
    AddPriority {
        parent: PackageId,
        child: PackageId,
        created: bool,
    },
    // Positions are where the removed entries sat in the parent's
    // `children` and the child's `parents`.
    RemoveEdge {
        parent: PackageId,
        child: PackageId,
        bundle: EdgeBundle,
        child_pos: usize,
        parent_pos: Option<usize>,
    },
    RemoveNode {
        id: PackageId,
        entry: NodeEntry<N>,
        incoming: Vec<(PackageId, usize, EdgeBundle)>,
        outgoing: Vec<(PackageId, usize)>,
    },
    SelfLoop,
}

/// A journal position returned by [`DependencyGraph::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// A borrowed view of one parent/child edge.
#[derive(Debug, Clone, Copy)]
pub struct Edge<'a> {
    /// The depending node.
    pub parent: PackageId,
    /// The node depended upon.
    pub child: PackageId,
    /// Every priority recorded between the pair, in insertion order.
    pub priorities: &'a [Priority],
    /// Global insertion sequence of the pair's first priority.
    pub seq: u64,
}

/// A directed multigraph of packages.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    nodes: Vec<Option<NodeEntry<N>>>,
    index: HashMap<N, PackageId>,
    next_seq: u64,
    journal: Vec<Change<N>>,
    self_loops: Vec<PackageId>,
}

impl<N> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
            journal: Vec::new(),
            self_loops: Vec::new(),
        }
    }
}

impl<N: Clone + Eq + Hash> DependencyGraph<N> {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn entry(&self, id: PackageId) -> Option<&NodeEntry<N>> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, id: PackageId) -> Option<&mut NodeEntry<N>> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Whether `id` refers to a live node.
    pub fn contains_id(&self, id: PackageId) -> bool {
        self.entry(id).is_some()
    }

    /// Id of a node value, if present.
    pub fn id_of(&self, value: &N) -> Option<PackageId> {
        self.index.get(value).copied()
    }

    /// Value of a node.
    pub fn node(&self, id: PackageId) -> Option<&N> {
        self.entry(id).map(|e| &e.value)
    }

    /// Live node ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = PackageId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| PackageId(i as u32))
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (PackageId, &N)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (PackageId(i as u32), &e.value)))
    }

    /// Insert a node, or return the id of the equal node already present.
    pub fn add_node(&mut self, value: N) -> PackageId {
        if let Some(&id) = self.index.get(&value) {
            return id;
        }
        let id = PackageId(self.nodes.len() as u32);
        self.index.insert(value.clone(), id);
        self.nodes.push(Some(NodeEntry {
            value,
            children: IndexMap::new(),
            parents: IndexSet::new(),
        }));
        self.journal.push(Change::AddNode(id));
        id
    }

    /// Record that `parent` depends on `child` with `priority`.
    ///
    /// Returns `Ok(false)` when the exact priority was already present
    /// between the pair. A self-dependency is rejected and remembered as an
    /// anomaly, see [`self_loops`](Self::self_loops).
    pub fn add_edge(&mut self, parent: PackageId, child: PackageId, priority: Priority) -> Result<bool, GraphError> {
        if !self.contains_id(parent) {
            return Err(GraphError::MissingNode(parent));
        }
        if !self.contains_id(child) {
            return Err(GraphError::MissingNode(child));
        }
        if parent == child {
            if !self.self_loops.contains(&parent) {
                self.self_loops.push(parent);
                self.journal.push(Change::SelfLoop);
            }
            return Err(GraphError::SelfLoop(parent));
        }

        let seq = self.next_seq;
        let entry = self.entry_mut(parent).ok_or(GraphError::MissingNode(parent))?;
        let created = !entry.children.contains_key(&child);
        let bundle = entry.children.entry(child).or_insert_with(|| EdgeBundle {
            priorities: Vec::new(),
            seq,
        });
        if bundle.priorities.contains(&priority) {
            return Ok(false);
        }
        bundle.priorities.push(priority);
        if created {
            self.next_seq += 1;
            if let Some(c) = self.entry_mut(child) {
                c.parents.insert(parent);
            }
        }
        self.journal.push(Change::AddPriority { parent, child, created });
        Ok(true)
    }

    /// Remove the edge between a pair, returning its priorities.
    pub fn remove_edge(&mut self, parent: PackageId, child: PackageId) -> Option<Vec<Priority>> {
        let (child_pos, _, bundle) = self.entry_mut(parent)?.children.shift_remove_full(&child)?;
        let parent_pos = self
            .entry_mut(child)
            .and_then(|c| c.parents.shift_remove_full(&parent))
            .map(|(pos, _)| pos);
        let priorities = bundle.priorities.clone();
        self.journal.push(Change::RemoveEdge {
            parent,
            child,
            bundle,
            child_pos,
            parent_pos,
        });
        Some(priorities)
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: PackageId) -> Option<N> {
        let entry = self.nodes.get_mut(id.index())?.take()?;
        self.index.remove(&entry.value);

        let mut incoming = Vec::with_capacity(entry.parents.len());
        for &p in &entry.parents {
            if let Some(pe) = self.entry_mut(p) {
                if let Some((pos, _, bundle)) = pe.children.shift_remove_full(&id) {
                    incoming.push((p, pos, bundle));
                }
            }
        }
        let mut outgoing = Vec::with_capacity(entry.children.len());
        for &c in entry.children.keys() {
            if let Some(ce) = self.entry_mut(c) {
                if let Some((pos, _)) = ce.parents.shift_remove_full(&id) {
                    outgoing.push((c, pos));
                }
            }
        }
        let value = entry.value.clone();
        self.journal.push(Change::RemoveNode {
            id,
            entry,
            incoming,
            outgoing,
        });
        Some(value)
    }

    /// Priorities recorded between a pair.
    pub fn priorities(&self, parent: PackageId, child: PackageId) -> Option<&[Priority]> {
        self.entry(parent)?
            .children
            .get(&child)
            .map(|b| b.priorities.as_slice())
    }

    /// Whether any edge exists between the pair.
    pub fn has_edge(&self, parent: PackageId, child: PackageId) -> bool {
        self.priorities(parent, child).is_some()
    }

    /// The edge between a pair.
    pub fn edge(&self, parent: PackageId, child: PackageId) -> Option<Edge<'_>> {
        let bundle = self.entry(parent)?.children.get(&child)?;
        Some(Edge {
            parent,
            child,
            priorities: &bundle.priorities,
            seq: bundle.seq,
        })
    }

    /// Every edge, grouped by parent in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = Edge<'_>> + '_ {
        self.nodes.iter().enumerate().flat_map(|(i, e)| {
            e.iter().flat_map(move |e| {
                e.children.iter().map(move |(&child, b)| Edge {
                    parent: PackageId(i as u32),
                    child,
                    priorities: &b.priorities,
                    seq: b.seq,
                })
            })
        })
    }

    /// Nodes `id` depends on.
    pub fn successors(&self, id: PackageId) -> Vec<PackageId> {
        self.entry(id)
            .map(|e| e.children.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes depending on `id`.
    pub fn predecessors(&self, id: PackageId) -> Vec<PackageId> {
        self.entry(id)
            .map(|e| e.parents.iter().copied().collect())
            .unwrap_or_default()
    }

    fn kept_children<'a>(
        &'a self,
        id: PackageId,
        ignore: &'a dyn Fn(&[Priority]) -> bool,
    ) -> impl Iterator<Item = PackageId> + 'a {
        self.entry(id).into_iter().flat_map(move |e| {
            e.children
                .iter()
                .filter(move |(_, b)| !ignore(&b.priorities))
                .map(|(&c, _)| c)
        })
    }

    /// Nodes `id` depends on through edges not ignored by `ignore`.
    pub fn successors_where(&self, id: PackageId, ignore: &dyn Fn(&[Priority]) -> bool) -> Vec<PackageId> {
        self.kept_children(id, ignore).collect()
    }

    /// Nodes depending on `id` through edges not ignored by `ignore`.
    pub fn predecessors_where(&self, id: PackageId, ignore: &dyn Fn(&[Priority]) -> bool) -> Vec<PackageId> {
        let Some(entry) = self.entry(id) else {
            return Vec::new();
        };
        entry
            .parents
            .iter()
            .copied()
            .filter(|&p| self.priorities(p, id).is_some_and(|ps| !ignore(ps)))
            .collect()
    }

    /// Nodes with no kept outgoing edges.
    pub fn leaf_nodes(&self, ignore: &dyn Fn(&[Priority]) -> bool) -> Vec<PackageId> {
        self.ids()
            .filter(|&id| self.kept_children(id, ignore).next().is_none())
            .collect()
    }

    /// Nodes nothing depends on.
    pub fn root_nodes(&self) -> Vec<PackageId> {
        self.nodes()
            .map(|(id, _)| id)
            .filter(|&id| self.entry(id).is_some_and(|e| e.parents.is_empty()))
            .collect()
    }

    /// Shortest path from `from` to `to` following kept edges.
    pub fn shortest_path(
        &self,
        from: PackageId,
        to: PackageId,
        ignore: &dyn Fn(&[Priority]) -> bool,
    ) -> Option<Vec<PackageId>> {
        if !self.contains_id(from) || !self.contains_id(to) {
            return None;
        }
        let mut prev: HashMap<PackageId, PackageId> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);
        while let Some(id) = queue.pop_front() {
            if id == to {
                let mut path = vec![to];
                let mut cur = to;
                while let Some(&p) = prev.get(&cur) {
                    path.push(p);
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            for c in self.kept_children(id, ignore) {
                if seen.insert(c) {
                    prev.insert(c, id);
                    queue.push_back(c);
                }
            }
        }
        None
    }

    /// Self-dependencies that were rejected by [`add_edge`](Self::add_edge).
    pub fn self_loops(&self) -> &[PackageId] {
        &self.self_loops
    }

    /// Mark the current state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    /// Undo every mutation made since `checkpoint`.
    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        while self.journal.len() > checkpoint.0 {
            let Some(change) = self.journal.pop() else {
                break;
            };
            self.undo(change);
        }
    }

    fn undo(&mut self, change: Change<N>) {
        match change {
            Change::AddNode(id) => {
                if let Some(Some(entry)) = self.nodes.pop() {
                    self.index.remove(&entry.value);
                }
                debug_assert_eq!(self.nodes.len(), id.index());
            }
            Change::AddPriority { parent, child, created } => {
                if created {
                    if let Some(p) = self.entry_mut(parent) {
                        p.children.shift_remove(&child);
                    }
                    if let Some(c) = self.entry_mut(child) {
                        c.parents.shift_remove(&parent);
                    }
                } else if let Some(bundle) = self
                    .entry_mut(parent)
                    .and_then(|p| p.children.get_mut(&child))
                {
                    bundle.priorities.pop();
                }
            }
            Change::RemoveEdge {
                parent,
                child,
                bundle,
                child_pos,
                parent_pos,
            } => {
                if let Some(p) = self.entry_mut(parent) {
                    let pos = child_pos.min(p.children.len());
                    p.children.shift_insert(pos, child, bundle);
                }
                if let (Some(c), Some(pos)) = (self.entry_mut(child), parent_pos) {
                    let pos = pos.min(c.parents.len());
                    c.parents.shift_insert(pos, parent);
                }
            }
            Change::RemoveNode {
                id,
                entry,
                incoming,
                outgoing,
            } => {
                for (c, pos) in outgoing {
                    if let Some(ce) = self.entry_mut(c) {
                        let pos = pos.min(ce.parents.len());
                        ce.parents.shift_insert(pos, id);
                    }
                }
                for (p, pos, bundle) in incoming {
                    if let Some(pe) = self.entry_mut(p) {
                        let pos = pos.min(pe.children.len());
                        pe.children.shift_insert(pos, id, bundle);
                    }
                }
                self.index.insert(entry.value.clone(), id);
                if let Some(slot) = self.nodes.get_mut(id.index()) {
                    *slot = Some(entry);
                }
            }
            Change::SelfLoop => {
                self.self_loops.pop();
            }
        }
    }

    /// Strongly connected components over kept edges (Tarjan), in discovery
    /// order.
    pub fn strongly_connected_components(&self, ignore: &dyn Fn(&[Priority]) -> bool) -> Vec<Vec<PackageId>> {
        struct Tarjan {
            counter: usize,
            index: HashMap<PackageId, usize>,
            low: HashMap<PackageId, usize>,
            stack: Vec<PackageId>,
            on_stack: HashSet<PackageId>,
            out: Vec<Vec<PackageId>>,
        }

        fn visit<N: Clone + Eq + Hash>(
            g: &DependencyGraph<N>,
            t: &mut Tarjan,
            v: PackageId,
            ignore: &dyn Fn(&[Priority]) -> bool,
        ) {
            t.index.insert(v, t.counter);
            t.low.insert(v, t.counter);
            t.counter += 1;
            t.stack.push(v);
            t.on_stack.insert(v);

            for w in g.kept_children(v, ignore) {
                if !t.index.contains_key(&w) {
                    visit(g, t, w, ignore);
                    let lw = t.low[&w];
                    if let Some(lv) = t.low.get_mut(&v) {
                        *lv = (*lv).min(lw);
                    }
                } else if t.on_stack.contains(&w) {
                    let iw = t.index[&w];
                    if let Some(lv) = t.low.get_mut(&v) {
                        *lv = (*lv).min(iw);
                    }
                }
            }

            if t.low[&v] == t.index[&v] {
                let mut component = Vec::new();
                while let Some(w) = t.stack.pop() {
                    t.on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort();
                t.out.push(component);
            }
        }

        let mut t = Tarjan {
            counter: 0,
            index: HashMap::new(),
            low: HashMap::new(),
            stack: Vec::new(),
            on_stack: HashSet::new(),
            out: Vec::new(),
        };
        for id in self.ids() {
            if !t.index.contains_key(&id) {
                visit(self, &mut t, id, ignore);
            }
        }
        t.out
    }

    /// Elementary cycles over kept edges, at most `limit` of them.
    ///
    /// Each cycle is listed starting from its smallest id, in edge order;
    /// the closing edge runs from the last node back to the first.
    pub fn find_cycles(&self, ignore: &dyn Fn(&[Priority]) -> bool, limit: usize) -> Vec<Vec<PackageId>> {
        let mut cycles = Vec::new();
        for component in self.strongly_connected_components(ignore) {
            if component.len() < 2 {
                continue;
            }
            for (i, &start) in component.iter().enumerate() {
                let allowed: HashSet<PackageId> = component[i..].iter().copied().collect();
                let mut path = vec![start];
                let mut on_path = HashSet::from([start]);
                self.cycles_from(start, start, &allowed, ignore, &mut path, &mut on_path, &mut cycles, limit);
                if cycles.len() >= limit {
                    return cycles;
                }
            }
        }
        cycles
    }

    #[allow(clippy::too_many_arguments)]
    fn cycles_from(
        &self,
        start: PackageId,
        at: PackageId,
        allowed: &HashSet<PackageId>,
        ignore: &dyn Fn(&[Priority]) -> bool,
        path: &mut Vec<PackageId>,
        on_path: &mut HashSet<PackageId>,
        out: &mut Vec<Vec<PackageId>>,
        limit: usize,
    ) {
        for next in self.kept_children(at, ignore) {
            if out.len() >= limit {
                return;
            }
            if next == start {
                out.push(path.clone());
            } else if allowed.contains(&next) && on_path.insert(next) {
                path.push(next);
                self.cycles_from(start, next, allowed, ignore, path, on_path, out, limit);
                path.pop();
                on_path.remove(&next);
            }
        }
    }

    /// Dependencies-first order over kept edges.
    ///
    /// Fails with [`GraphError::CycleDetected`] carrying one cycle when the
    /// kept edges are not acyclic.
    pub fn topological_order(&self, ignore: &dyn Fn(&[Priority]) -> bool) -> Result<Vec<PackageId>, GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }

        let mut marks: HashMap<PackageId, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.len());

        for root in self.ids() {
            if marks.contains_key(&root) {
                continue;
            }
            // (node, children, next child index)
            let mut stack: Vec<(PackageId, Vec<PackageId>, usize)> =
                vec![(root, self.successors_where(root, ignore), 0)];
            marks.insert(root, Mark::Active);

            while let Some((node, children, pos)) = stack.last_mut() {
                if let Some(&child) = children.get(*pos) {
                    *pos += 1;
                    match marks.get(&child) {
                        None => {
                            marks.insert(child, Mark::Active);
                            let grandchildren = self.successors_where(child, ignore);
                            stack.push((child, grandchildren, 0));
                        }
                        Some(Mark::Active) => {
                            let from = stack.iter().position(|(n, _, _)| *n == child).unwrap_or(0);
                            let cycle = stack[from..].iter().map(|(n, _, _)| *n).collect();
                            return Err(GraphError::CycleDetected { cycle });
                        }
                        Some(Mark::Done) => {}
                    }
                } else {
                    let done = *node;
                    marks.insert(done, Mark::Done);
                    order.push(done);
                    stack.pop();
                }
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn keep_all(_: &[Priority]) -> bool {
        false
    }

    fn graph(names: &[&'static str]) -> (DependencyGraph<&'static str>, Vec<PackageId>) {
        let mut g = DependencyGraph::new();
        let ids = names.iter().map(|n| g.add_node(*n)).collect();
        (g, ids)
    }

    #[test]
    fn add_node_is_idempotent() {
        let mut g = DependencyGraph::new();
        let a = g.add_node("a");
        assert_eq!(g.add_node("a"), a);
        assert_eq!(g.len(), 1);
        assert_eq!(g.id_of(&"a"), Some(a));
        assert_eq!(g.node(a), Some(&"a"));
    }

    #[test]
    fn edges_accumulate_distinct_priorities() {
        let (mut g, ids) = graph(&["a", "b"]);
        assert_eq!(g.add_edge(ids[0], ids[1], Priority::buildtime()), Ok(true));
        assert_eq!(g.add_edge(ids[0], ids[1], Priority::runtime_post()), Ok(true));
        assert_eq!(g.add_edge(ids[0], ids[1], Priority::buildtime()), Ok(false));
        assert_eq!(
            g.priorities(ids[0], ids[1]),
            Some(&[Priority::buildtime(), Priority::runtime_post()][..])
        );
        assert_eq!(g.successors(ids[0]), vec![ids[1]]);
        assert_eq!(g.predecessors(ids[1]), vec![ids[0]]);
    }

    #[test]
    fn self_loops_are_reported() {
        let (mut g, ids) = graph(&["a"]);
        assert_eq!(
            g.add_edge(ids[0], ids[0], Priority::buildtime()),
            Err(GraphError::SelfLoop(ids[0]))
        );
        assert_eq!(g.self_loops(), &[ids[0]]);
        assert!(g.successors(ids[0]).is_empty());
    }

    #[test]
    fn missing_nodes_are_rejected() {
        let (mut g, ids) = graph(&["a", "b"]);
        g.remove_node(ids[1]);
        assert_eq!(
            g.add_edge(ids[0], ids[1], Priority::runtime()),
            Err(GraphError::MissingNode(ids[1]))
        );
    }

    #[test]
    fn remove_node_drops_touching_edges() {
        let (mut g, ids) = graph(&["a", "b", "c"]);
        g.add_edge(ids[0], ids[1], Priority::runtime()).unwrap();
        g.add_edge(ids[1], ids[2], Priority::runtime()).unwrap();
        assert_eq!(g.remove_node(ids[1]), Some("b"));
        assert!(g.successors(ids[0]).is_empty());
        assert!(g.predecessors(ids[2]).is_empty());
        assert_eq!(g.edges().count(), 0);
        assert_eq!(g.id_of(&"b"), None);
    }

    #[test]
    fn rewind_restores_state() {
        let (mut g, ids) = graph(&["a", "b"]);
        g.add_edge(ids[0], ids[1], Priority::runtime()).unwrap();
        let cp = g.checkpoint();

        let c = g.add_node("c");
        g.add_edge(ids[1], c, Priority::buildtime()).unwrap();
        g.add_edge(ids[0], ids[1], Priority::buildtime()).unwrap();
        g.remove_node(ids[0]);
        let _ = g.add_edge(ids[1], ids[1], Priority::runtime());
        assert_eq!(g.len(), 2);

        g.rewind(cp);
        assert_eq!(g.len(), 2);
        assert_eq!(g.id_of(&"c"), None);
        assert_eq!(g.priorities(ids[0], ids[1]), Some(&[Priority::runtime()][..]));
        assert!(g.successors(ids[1]).is_empty());
        assert!(g.self_loops().is_empty());
        assert_eq!(g.predecessors(ids[1]), vec![ids[0]]);
    }

    #[test]
    fn rewind_keeps_edge_order() {
        let (mut g, ids) = graph(&["top", "a", "b", "c", "user"]);
        for &child in &ids[1..4] {
            g.add_edge(ids[0], child, Priority::runtime()).unwrap();
        }
        g.add_edge(ids[4], ids[2], Priority::runtime()).unwrap();
        let children = g.successors(ids[0]);
        let edges: Vec<(PackageId, PackageId)> = g.edges().map(|e| (e.parent, e.child)).collect();
        let cp = g.checkpoint();

        g.remove_edge(ids[0], ids[1]);
        g.remove_node(ids[2]);
        g.rewind(cp);

        assert_eq!(g.successors(ids[0]), children);
        assert_eq!(g.predecessors(ids[2]), vec![ids[0], ids[4]]);
        assert_eq!(g.edges().map(|e| (e.parent, e.child)).collect::<Vec<_>>(), edges);
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let (mut g, ids) = graph(&["app", "lib", "base"]);
        g.add_edge(ids[0], ids[1], Priority::buildtime()).unwrap();
        g.add_edge(ids[1], ids[2], Priority::runtime()).unwrap();
        g.add_edge(ids[0], ids[2], Priority::runtime()).unwrap();
        assert_eq!(g.topological_order(&keep_all), Ok(vec![ids[2], ids[1], ids[0]]));
    }

    #[test]
    fn topological_order_reports_cycle() {
        let (mut g, ids) = graph(&["a", "b", "c"]);
        g.add_edge(ids[0], ids[1], Priority::buildtime()).unwrap();
        g.add_edge(ids[1], ids[2], Priority::buildtime()).unwrap();
        g.add_edge(ids[2], ids[1], Priority::runtime_post()).unwrap();
        assert_eq!(
            g.topological_order(&keep_all),
            Err(GraphError::CycleDetected { cycle: vec![ids[1], ids[2]] })
        );
        // Ignoring the post-merge edge breaks the cycle.
        let ignore_post = |ps: &[Priority]| ps.iter().all(|p| p.runtime_post);
        assert!(g.topological_order(&ignore_post).is_ok());
    }

    #[test]
    fn cycles_and_components() {
        let (mut g, ids) = graph(&["a", "b", "c", "d"]);
        g.add_edge(ids[0], ids[1], Priority::runtime()).unwrap();
        g.add_edge(ids[1], ids[0], Priority::runtime()).unwrap();
        g.add_edge(ids[1], ids[2], Priority::runtime()).unwrap();
        g.add_edge(ids[2], ids[0], Priority::buildtime()).unwrap();
        g.add_edge(ids[2], ids[3], Priority::buildtime()).unwrap();

        let sccs = g.strongly_connected_components(&keep_all);
        assert!(sccs.contains(&vec![ids[0], ids[1], ids[2]]));
        assert!(sccs.contains(&vec![ids[3]]));

        let cycles = g.find_cycles(&keep_all, 100);
        assert_eq!(cycles, vec![vec![ids[0], ids[1]], vec![ids[0], ids[1], ids[2]]]);
        assert_eq!(g.find_cycles(&keep_all, 1).len(), 1);

        let only_build = |ps: &[Priority]| ps.iter().all(|p| !p.buildtime);
        assert!(g.find_cycles(&only_build, 100).is_empty());
    }

    #[test]
    fn leaves_roots_and_paths() {
        let (mut g, ids) = graph(&["a", "b", "c"]);
        g.add_edge(ids[0], ids[1], Priority::runtime()).unwrap();
        g.add_edge(ids[1], ids[2], Priority::optional()).unwrap();
        assert_eq!(g.root_nodes(), vec![ids[0]]);
        assert_eq!(g.leaf_nodes(&keep_all), vec![ids[2]]);
        let ignore_optional = |ps: &[Priority]| ps.iter().all(|p| p.optional);
        assert_eq!(g.leaf_nodes(&ignore_optional), vec![ids[1], ids[2]]);
        assert_eq!(g.shortest_path(ids[0], ids[2], &keep_all), Some(vec![ids[0], ids[1], ids[2]]));
        assert_eq!(g.shortest_path(ids[0], ids[2], &ignore_optional), None);
    }

    #[test]
    fn edge_sequence_follows_insertion() {
        let (mut g, ids) = graph(&["a", "b", "c"]);
        g.add_edge(ids[1], ids[2], Priority::runtime()).unwrap();
        g.add_edge(ids[0], ids[1], Priority::runtime()).unwrap();
        g.add_edge(ids[1], ids[2], Priority::buildtime()).unwrap();
        let first = g.edge(ids[1], ids[2]).unwrap().seq;
        let second = g.edge(ids[0], ids[1]).unwrap().seq;
        assert!(first < second);
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::buildtime()),
            Just(Priority::runtime()),
            Just(Priority::runtime_post()),
            Just(Priority::optional()),
            Just(Priority::runtime().with_satisfied(true)),
        ]
    }

    proptest! {
        #[test]
        fn repeated_add_edge_never_duplicates(
            edges in prop::collection::vec((0usize..4, 0usize..4, priority_strategy()), 0..40),
            repeats in 1usize..4,
        ) {
            let (mut g, ids) = graph(&["a", "b", "c", "d"]);
            for _ in 0..repeats {
                for (p, c, prio) in &edges {
                    let _ = g.add_edge(ids[*p], ids[*c], *prio);
                }
            }
            for edge in g.edges() {
                let unique: HashSet<&Priority> = edge.priorities.iter().collect();
                prop_assert_eq!(unique.len(), edge.priorities.len());
            }
        }
    }
}
