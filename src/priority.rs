//! Dependency edge priorities.
//!
//! Every edge in the dependency graph carries one or more [`Priority`]
//! values describing why the edge exists. A *priority range* maps a
//! priority to a hardness level; merge ordering ignores edges whose
//! hardness is at or below the current level, which is how cycles are
//! broken at the least harmful edge.
//!
//! Three ranges exist:
//!
//! * [`NormalRange`] for general ordering,
//! * [`SatisfiedRange`] which additionally distinguishes dependencies that
//!   are already satisfied by an installed package,
//! * [`UnmergeRange`] for ordering removals.

use std::fmt;

/// Attributes of one dependency edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Priority {
    /// Needed to build (DEPEND/BDEPEND).
    pub buildtime: bool,
    /// Build-time dependency with a `:=` slot operator.
    pub buildtime_slot_op: bool,
    /// Needed at runtime (RDEPEND).
    pub runtime: bool,
    /// Runtime dependency with a `:=` slot operator.
    pub runtime_slot_op: bool,
    /// Needed after merge (PDEPEND).
    pub runtime_post: bool,
    /// Needed while installing (IDEPEND).
    pub installtime: bool,
    /// Pulled in only to keep installed packages consistent.
    pub optional: bool,
    /// Kept only for display.
    pub ignored: bool,
    /// The child is already installed and satisfies the dependency.
    pub satisfied: bool,
    /// Build-host dependency in a cross-compile setup.
    pub cross: bool,
}

impl Priority {
    /// Build-time edge.
    pub fn buildtime() -> Self {
        Self {
            buildtime: true,
            ..Self::default()
        }
    }

    /// Build-time edge with a slot operator.
    pub fn buildtime_slot_op() -> Self {
        Self {
            buildtime: true,
            buildtime_slot_op: true,
            ..Self::default()
        }
    }

    /// Runtime edge.
    pub fn runtime() -> Self {
        Self {
            runtime: true,
            ..Self::default()
        }
    }

    /// Runtime edge with a slot operator.
    pub fn runtime_slot_op() -> Self {
        Self {
            runtime: true,
            runtime_slot_op: true,
            ..Self::default()
        }
    }

    /// Post-merge edge.
    pub fn runtime_post() -> Self {
        Self {
            runtime_post: true,
            ..Self::default()
        }
    }

    /// Install-time edge.
    pub fn installtime() -> Self {
        Self {
            installtime: true,
            ..Self::default()
        }
    }

    /// Optional edge.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Self::default()
        }
    }

    /// Mark the edge as already satisfied by an installed package.
    pub fn with_satisfied(mut self, satisfied: bool) -> Self {
        self.satisfied = satisfied;
        self
    }

    /// True when no attribute is set.
    pub fn is_none(&self) -> bool {
        *self == Self::default()
    }

    /// True for edges that only need the child by the time the parent runs.
    pub fn is_runtime_level(&self) -> bool {
        !self.buildtime && !self.installtime && (self.runtime || self.runtime_post)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (on, name) in [
            (self.buildtime_slot_op, "buildtime_slot_op"),
            (self.buildtime && !self.buildtime_slot_op, "buildtime"),
            (self.installtime, "installtime"),
            (self.runtime_slot_op, "runtime_slot_op"),
            (self.runtime && !self.runtime_slot_op, "runtime"),
            (self.runtime_post, "runtime_post"),
            (self.optional, "optional"),
            (self.ignored, "ignored"),
            (self.cross, "cross"),
        ] {
            if on {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            parts.push("none");
        }
        write!(f, "{}", parts.join(","))?;
        if self.satisfied {
            write!(f, " (satisfied)")?;
        }
        Ok(())
    }
}

/// A mapping from priorities to hardness levels.
///
/// An edge may be ignored at `level` iff its hardness is `<= level`.
pub trait PriorityRange {
    /// Hardness of edges with no attributes.
    const NONE: i8;
    /// Softest level that still means something.
    const SOFT: i8;
    /// Hardest level; edges this hard are never ignored during normal
    /// ordering.
    const HARD: i8;

    /// Hardness of one priority.
    fn hardness(priority: &Priority) -> i8;

    /// Levels from softest to just below hard, in the order cycle breaking
    /// tries them.
    fn levels() -> std::ops::RangeInclusive<i8> {
        Self::NONE..=(Self::HARD - 1)
    }

    /// Whether a priority may be ignored at `level`.
    fn ignore(priority: &Priority, level: i8) -> bool {
        Self::hardness(priority) <= level
    }

    /// Hardness of an edge carrying several priorities: the hardest wins.
    fn edge_hardness(priorities: &[Priority]) -> i8 {
        priorities
            .iter()
            .map(Self::hardness)
            .max()
            .unwrap_or(Self::NONE)
    }

    /// Whether a whole edge may be ignored at `level`.
    fn ignore_edge(priorities: &[Priority], level: i8) -> bool {
        Self::edge_hardness(priorities) <= level
    }
}

/// Ordering without regard for what is installed.
#[derive(Debug, Clone, Copy)]
pub struct NormalRange;

impl NormalRange {
    /// Soft runtime: post-merge dependencies.
    pub const MEDIUM_SOFT: i8 = 2;
    /// Runtime dependencies.
    pub const MEDIUM: i8 = 3;
}

impl PriorityRange for NormalRange {
    const NONE: i8 = 0;
    const SOFT: i8 = 1;
    const HARD: i8 = 4;

    fn hardness(p: &Priority) -> i8 {
        if p.buildtime || p.buildtime_slot_op || p.installtime {
            Self::HARD
        } else if p.runtime || p.runtime_slot_op {
            Self::MEDIUM
        } else if p.runtime_post {
            Self::MEDIUM_SOFT
        } else if p.optional || p.ignored {
            Self::SOFT
        } else {
            Self::NONE
        }
    }
}

/// Ordering that prefers breaking edges to packages already installed.
#[derive(Debug, Clone, Copy)]
pub struct SatisfiedRange;

impl SatisfiedRange {
    /// Satisfied post-merge.
    pub const SATISFIED_RUNTIME_POST: i8 = 2;
    /// Satisfied runtime.
    pub const SATISFIED_RUNTIME: i8 = 3;
    /// Satisfied build-time.
    pub const SATISFIED_BUILDTIME: i8 = 4;
    /// Unsatisfied post-merge.
    pub const RUNTIME_POST: i8 = 5;
    /// Unsatisfied runtime.
    pub const RUNTIME: i8 = 6;
}

impl PriorityRange for SatisfiedRange {
    const NONE: i8 = 0;
    const SOFT: i8 = 1;
    const HARD: i8 = 7;

    fn hardness(p: &Priority) -> i8 {
        if p.buildtime_slot_op {
            return Self::HARD;
        }
        if p.buildtime || p.installtime {
            return if p.satisfied && !p.installtime {
                Self::SATISFIED_BUILDTIME
            } else {
                Self::HARD
            };
        }
        if p.runtime || p.runtime_slot_op {
            return if p.satisfied {
                Self::SATISFIED_RUNTIME
            } else {
                Self::RUNTIME
            };
        }
        if p.runtime_post {
            return if p.satisfied {
                Self::SATISFIED_RUNTIME_POST
            } else {
                Self::RUNTIME_POST
            };
        }
        if p.optional || p.ignored {
            Self::SOFT
        } else {
            Self::NONE
        }
    }
}

/// Ordering of removals: a package should be removed before what it needs
/// at install time, and the build-time relation is irrelevant.
#[derive(Debug, Clone, Copy)]
pub struct UnmergeRange;

impl UnmergeRange {
    /// Runtime dependency with slot operator.
    pub const RUNTIME_SLOT_OP: i8 = -1;
    /// Runtime dependency.
    pub const RUNTIME: i8 = -2;
    /// Post-merge dependency.
    pub const RUNTIME_POST: i8 = -3;
}

impl PriorityRange for UnmergeRange {
    const NONE: i8 = -5;
    const SOFT: i8 = -4;
    const HARD: i8 = 0;

    fn hardness(p: &Priority) -> i8 {
        if p.installtime {
            Self::HARD
        } else if p.runtime_slot_op {
            Self::RUNTIME_SLOT_OP
        } else if p.runtime {
            Self::RUNTIME
        } else if p.runtime_post {
            Self::RUNTIME_POST
        } else if p.buildtime || p.optional {
            Self::SOFT
        } else {
            Self::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_range_table() {
        assert_eq!(NormalRange::hardness(&Priority::buildtime()), 4);
        assert_eq!(NormalRange::hardness(&Priority::buildtime_slot_op()), 4);
        assert_eq!(NormalRange::hardness(&Priority::installtime()), 4);
        assert_eq!(NormalRange::hardness(&Priority::runtime()), 3);
        assert_eq!(NormalRange::hardness(&Priority::runtime_slot_op()), 3);
        assert_eq!(NormalRange::hardness(&Priority::runtime_post()), 2);
        assert_eq!(NormalRange::hardness(&Priority::optional()), 1);
        assert_eq!(NormalRange::hardness(&Priority::default()), 0);
    }

    #[test]
    fn satisfied_range_table() {
        let sat = |p: Priority| SatisfiedRange::hardness(&p.with_satisfied(true));
        let unsat = |p: Priority| SatisfiedRange::hardness(&p);
        assert_eq!(unsat(Priority::buildtime()), 7);
        assert_eq!(sat(Priority::buildtime_slot_op()), 7);
        assert_eq!(unsat(Priority::installtime()), 7);
        assert_eq!(unsat(Priority::runtime()), 6);
        assert_eq!(unsat(Priority::runtime_post()), 5);
        assert_eq!(sat(Priority::buildtime()), 4);
        assert_eq!(sat(Priority::runtime()), 3);
        assert_eq!(sat(Priority::runtime_post()), 2);
        assert_eq!(unsat(Priority::optional()), 1);
        assert_eq!(unsat(Priority::default()), 0);
    }

    #[test]
    fn unmerge_range_table() {
        assert_eq!(UnmergeRange::hardness(&Priority::installtime()), 0);
        assert_eq!(UnmergeRange::hardness(&Priority::runtime_slot_op()), -1);
        assert_eq!(UnmergeRange::hardness(&Priority::runtime()), -2);
        assert_eq!(UnmergeRange::hardness(&Priority::runtime_post()), -3);
        assert_eq!(UnmergeRange::hardness(&Priority::buildtime()), -4);
        assert_eq!(UnmergeRange::hardness(&Priority::default()), -5);
    }

    #[test]
    fn ignore_is_monotonic_in_level() {
        let priorities = [
            Priority::buildtime(),
            Priority::runtime(),
            Priority::runtime_post(),
            Priority::optional(),
            Priority::default(),
            Priority::runtime().with_satisfied(true),
        ];
        for p in &priorities {
            let mut ignored = false;
            for level in SatisfiedRange::NONE..=SatisfiedRange::HARD {
                let now = SatisfiedRange::ignore(p, level);
                assert!(!ignored || now, "{p} un-ignored at level {level}");
                ignored = now;
            }
        }
    }

    #[test]
    fn edge_hardness_takes_max() {
        let edge = [Priority::runtime_post(), Priority::buildtime()];
        assert_eq!(NormalRange::edge_hardness(&edge), NormalRange::HARD);
        assert!(!NormalRange::ignore_edge(&edge, NormalRange::MEDIUM));
        assert_eq!(NormalRange::edge_hardness(&[]), NormalRange::NONE);
    }

    #[test]
    fn levels_stop_below_hard() {
        assert_eq!(SatisfiedRange::levels().collect::<Vec<_>>(), (0..=6).collect::<Vec<_>>());
        assert_eq!(UnmergeRange::levels().last(), Some(-1));
    }

    #[test]
    fn display() {
        assert_eq!(Priority::runtime_slot_op().to_string(), "runtime_slot_op");
        assert_eq!(Priority::buildtime().with_satisfied(true).to_string(), "buildtime (satisfied)");
        assert_eq!(Priority::default().to_string(), "none");
    }
}
