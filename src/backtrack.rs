//! Exploration of alternative resolution attempts.
//!
//! Each attempt runs with a [`BacktrackParameter`]: packages to mask, USE
//! changes and keywords to assume. When an attempt fails the resolver feeds
//! [`BacktrackInfo`] back, and the [`Backtracker`] derives new parameters to
//! try. Nodes are explored breadth-first and never twice; masking steps are
//! bounded by the `--backtrack` budget and the total number of attempts is
//! bounded as well, so exploration always terminates.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use crate::atom::Dep;
use crate::package::CandidateKey;

/// Why a candidate is masked for the rest of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskCause {
    /// It lost a slot conflict. `parents` are the candidates that pulled it in.
    SlotConflict {
        /// Candidates whose atoms selected the masked package.
        parents: Vec<CandidateKey>,
    },
    /// One of its dependencies could not be satisfied.
    MissingDependency {
        /// The unsatisfied atom.
        atom: Dep,
    },
}

impl fmt::Display for MaskCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskCause::SlotConflict { .. } => write!(f, "masked by backtracking: slot conflict"),
            MaskCause::MissingDependency { atom } => {
                write!(f, "masked by backtracking: missing dependency {atom}")
            }
        }
    }
}

/// Assumptions for one resolution attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktrackParameter {
    /// Candidates that must not be selected.
    pub runtime_pkg_mask: IndexMap<CandidateKey, MaskCause>,
    /// USE flips to apply to ebuild candidates.
    pub needed_use_changes: IndexMap<CandidateKey, BTreeMap<String, bool>>,
    /// Keyword-masked candidates to treat as visible.
    pub needed_unstable_keywords: IndexSet<CandidateKey>,
}

impl BacktrackParameter {
    /// Whether the attempt needs configuration changes.
    pub fn has_config_changes(&self) -> bool {
        !self.needed_use_changes.is_empty() || !self.needed_unstable_keywords.is_empty()
    }

    /// A slot-conflict mask is pointless once every parent that pulled the
    /// masked package in is itself masked.
    fn masks_are_consistent(&self) -> bool {
        self.runtime_pkg_mask.values().all(|cause| match cause {
            MaskCause::MissingDependency { .. } => true,
            MaskCause::SlotConflict { parents } => {
                parents.is_empty() || parents.iter().any(|p| !self.runtime_pkg_mask.contains_key(p))
            }
        })
    }
}

/// Configuration changes an attempt found necessary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigChanges {
    /// USE flips per candidate.
    pub use_changes: Vec<(CandidateKey, BTreeMap<String, bool>)>,
    /// Candidates needing their keyword accepted.
    pub unstable_keywords: Vec<CandidateKey>,
}

impl ConfigChanges {
    /// Whether nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.use_changes.is_empty() && self.unstable_keywords.is_empty()
    }
}

/// Feedback from a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BacktrackInfo {
    /// Several candidates competed for one slot; each entry is a candidate
    /// and the candidates that pulled it in.
    SlotConflict {
        /// Conflicting candidates.
        candidates: Vec<(CandidateKey, Vec<CandidateKey>)>,
    },
    /// `parent` has a dependency nothing satisfies.
    MissingDependency {
        /// The package with the unsatisfied dependency.
        parent: CandidateKey,
        /// The atom.
        atom: Dep,
    },
    /// Configuration changes would let the attempt proceed.
    Config(ConfigChanges),
}

#[derive(Debug, Clone)]
struct Node {
    parameter: BacktrackParameter,
    depth: usize,
    mask_steps: usize,
    terminal: bool,
}

/// Breadth-first explorer of backtrack parameters.
#[derive(Debug)]
pub struct Backtracker {
    max_depth: usize,
    max_attempts: usize,
    attempts: usize,
    nodes: Vec<Node>,
    unexplored: VecDeque<usize>,
    current: Option<usize>,
}

impl Backtracker {
    /// A backtracker allowing `max_depth` masking steps.
    pub fn new(max_depth: usize) -> Self {
        let root = Node {
            parameter: BacktrackParameter::default(),
            depth: 0,
            mask_steps: 0,
            terminal: true,
        };
        Self {
            max_depth,
            max_attempts: (max_depth + 1) * 5,
            attempts: 0,
            nodes: vec![root],
            unexplored: VecDeque::from([0]),
            current: None,
        }
    }

    /// Override the total attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// The next parameter to try, if any remain.
    pub fn next_parameter(&mut self) -> Option<BacktrackParameter> {
        if self.attempts >= self.max_attempts {
            debug!(attempts = self.attempts, "backtracking attempt limit reached");
            return None;
        }
        let idx = self.unexplored.pop_front()?;
        self.attempts += 1;
        self.current = Some(idx);
        Some(self.nodes[idx].parameter.clone())
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Nodes waiting to be explored.
    pub fn pending(&self) -> usize {
        self.unexplored.len()
    }

    /// Whether anything beyond the initial attempt was derived.
    pub fn backtracked(&self) -> bool {
        self.nodes.len() > 1
    }

    /// Derive new parameters from the failure of the current attempt.
    ///
    /// Configuration changes are applied first and only explored on their
    /// own when they are the sole feedback. Of the remaining infos, only the
    /// first slot conflict or the first missing dependency is acted on, as
    /// later problems may be consequences of it.
    pub fn feedback(&mut self, infos: Vec<BacktrackInfo>) {
        let Some(mut base) = self.current.map(|i| self.nodes[i].clone()) else {
            return;
        };
        let only_config = infos.iter().all(|i| matches!(i, BacktrackInfo::Config(_)));

        let mut changes = ConfigChanges::default();
        for info in &infos {
            if let BacktrackInfo::Config(c) = info {
                changes.use_changes.extend(c.use_changes.iter().cloned());
                changes.unstable_keywords.extend(c.unstable_keywords.iter().cloned());
            }
        }
        if !changes.is_empty() {
            let node = self.config_node(&base, changes);
            base = node.clone();
            self.add(node, only_config);
        }

        if let Some(BacktrackInfo::SlotConflict { candidates }) = infos
            .iter()
            .find(|i| matches!(i, BacktrackInfo::SlotConflict { .. }))
        {
            for (pkg, parents) in candidates {
                let mut node = base.clone();
                node.depth += 1;
                node.mask_steps += 1;
                node.terminal = false;
                node.parameter.runtime_pkg_mask.insert(
                    pkg.clone(),
                    MaskCause::SlotConflict {
                        parents: parents.clone(),
                    },
                );
                self.add(node, true);
            }
        } else if let Some(BacktrackInfo::MissingDependency { parent, atom }) = infos
            .iter()
            .find(|i| matches!(i, BacktrackInfo::MissingDependency { .. }))
        {
            let mut node = base.clone();
            node.depth += 1;
            node.mask_steps += 1;
            node.terminal = false;
            node.parameter
                .runtime_pkg_mask
                .insert(parent.clone(), MaskCause::MissingDependency { atom: atom.clone() });
            self.add(node, true);
        }
    }

    fn config_node(&self, base: &Node, changes: ConfigChanges) -> Node {
        let mut node = base.clone();
        node.depth += 1;
        for (pkg, flips) in changes.use_changes {
            node.parameter
                .needed_use_changes
                .entry(pkg)
                .or_default()
                .extend(flips);
        }
        node.parameter
            .needed_unstable_keywords
            .extend(changes.unstable_keywords);
        node
    }

    fn add(&mut self, node: Node, explore: bool) {
        if !node.parameter.masks_are_consistent() {
            trace!("dropping backtrack node with redundant masks");
            return;
        }
        if node.mask_steps > self.max_depth {
            trace!(mask_steps = node.mask_steps, "backtrack budget exhausted");
            return;
        }
        if self.nodes.iter().any(|n| n.parameter == node.parameter) {
            return;
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        if explore {
            self.unexplored.push_back(idx);
        }
    }

    /// The terminal parameter with the most configuration changes and no
    /// masks, for reporting autounmask suggestions.
    pub fn best_config_run(&self) -> BacktrackParameter {
        let mut best = &self.nodes[0];
        for node in &self.nodes {
            if node.terminal && node.depth > best.depth {
                best = node;
            }
        }
        best.parameter.clone()
    }
}

#[cfg(test)]
mod tests {
    use portage_atom::{Cpn, Version};

    use super::*;
    use crate::atom::parse_atom;
    use crate::package::Provenance;

    fn key(name: &str, ver: &str) -> CandidateKey {
        CandidateKey {
            cpn: Cpn::new("dev-libs", name),
            version: Version::parse(ver).unwrap(),
            repo: None,
            provenance: Provenance::Ebuild,
        }
    }

    fn missing(parent: CandidateKey) -> BacktrackInfo {
        BacktrackInfo::MissingDependency {
            parent,
            atom: parse_atom("dev-libs/gone").unwrap(),
        }
    }

    #[test]
    fn root_first() {
        let mut bt = Backtracker::new(3);
        assert_eq!(bt.next_parameter(), Some(BacktrackParameter::default()));
        assert_eq!(bt.next_parameter(), None);
        assert!(!bt.backtracked());
    }

    #[test]
    fn slot_conflict_branches_breadth_first() {
        let mut bt = Backtracker::new(3);
        bt.next_parameter();
        bt.feedback(vec![BacktrackInfo::SlotConflict {
            candidates: vec![(key("a", "1"), vec![]), (key("a", "2"), vec![])],
        }]);
        assert_eq!(bt.pending(), 2);
        let first = bt.next_parameter().unwrap();
        assert!(first.runtime_pkg_mask.contains_key(&key("a", "1")));
        // A deeper node derived from the first branch waits behind the
        // second branch.
        bt.feedback(vec![missing(key("b", "1"))]);
        let second = bt.next_parameter().unwrap();
        assert!(second.runtime_pkg_mask.contains_key(&key("a", "2")));
        let third = bt.next_parameter().unwrap();
        assert_eq!(third.runtime_pkg_mask.len(), 2);
    }

    #[test]
    fn duplicate_nodes_are_not_revisited() {
        let mut bt = Backtracker::new(5);
        bt.next_parameter();
        bt.feedback(vec![missing(key("a", "1"))]);
        bt.next_parameter();
        bt.feedback(vec![missing(key("a", "1"))]);
        assert_eq!(bt.pending(), 0);
        assert_eq!(bt.next_parameter(), None);
    }

    #[test]
    fn mask_steps_are_bounded() {
        let mut bt = Backtracker::new(2);
        let mut runs = 0;
        let mut n = 0;
        while bt.next_parameter().is_some() {
            runs += 1;
            n += 1;
            bt.feedback(vec![missing(key("p", &n.to_string()))]);
        }
        assert_eq!(runs, 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let mut bt = Backtracker::new(100).with_max_attempts(4);
        let mut n = 0;
        while bt.next_parameter().is_some() {
            n += 1;
            bt.feedback(vec![BacktrackInfo::Config(ConfigChanges {
                use_changes: vec![(key("u", &n.to_string()), BTreeMap::from([("x".to_string(), true)]))],
                unstable_keywords: vec![],
            })]);
        }
        assert_eq!(bt.attempts(), 4);
    }

    #[test]
    fn config_changes_do_not_count_as_masks() {
        let mut bt = Backtracker::new(0);
        bt.next_parameter();
        bt.feedback(vec![BacktrackInfo::Config(ConfigChanges {
            use_changes: vec![],
            unstable_keywords: vec![key("k", "2")],
        })]);
        let p = bt.next_parameter().unwrap();
        assert!(p.needed_unstable_keywords.contains(&key("k", "2")));
        assert!(p.has_config_changes());
        assert_eq!(bt.best_config_run(), p);
    }

    #[test]
    fn config_with_conflict_is_not_explored_alone() {
        let mut bt = Backtracker::new(3);
        bt.next_parameter();
        bt.feedback(vec![
            BacktrackInfo::Config(ConfigChanges {
                use_changes: vec![(key("u", "1"), BTreeMap::from([("ssl".to_string(), true)]))],
                unstable_keywords: vec![],
            }),
            missing(key("p", "1")),
        ]);
        assert_eq!(bt.pending(), 1);
        let p = bt.next_parameter().unwrap();
        assert!(p.needed_use_changes.contains_key(&key("u", "1")));
        assert!(p.runtime_pkg_mask.contains_key(&key("p", "1")));
    }

    #[test]
    fn redundant_slot_masks_are_dropped() {
        let mut bt = Backtracker::new(5);
        bt.next_parameter();
        bt.feedback(vec![missing(key("parent", "1"))]);
        bt.next_parameter();
        bt.feedback(vec![BacktrackInfo::SlotConflict {
            candidates: vec![(key("child", "1"), vec![key("parent", "1")])],
        }]);
        assert_eq!(bt.pending(), 0);
    }
}
