//! Error types shared across the crate.
//!
//! Resolution *problems* (unsatisfiable atoms, slot conflicts, cycles) are not
//! errors: they are collected into a [`Resolution`](crate::Resolution). The
//! types here cover malformed input, broken graph invariants and collaborator
//! failures.

use crate::graph::PackageId;

/// A malformed atom or version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AtomError {
    /// The atom grammar rejected the input.
    #[error(transparent)]
    Parse(#[from] portage_atom::Error),
    /// A version without a comparison operator (`cat/pkg-1.0`).
    #[error("invalid atom '{0}': a version requires an operator")]
    MissingOperator(String),
    /// A `*` glob on an operator other than `=`.
    #[error("invalid atom '{0}': '*' is only valid with '='")]
    MisplacedGlob(String),
    /// A version string could not be parsed.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
}

/// A malformed dependency or REQUIRED_USE string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DepStringError {
    /// The dependency-string grammar rejected the input.
    #[error(transparent)]
    Syntax(#[from] portage_atom::Error),
    /// A `(` was never closed.
    #[error("unclosed group opened at token {0}")]
    UnclosedGroup(usize),
    /// A `)` appeared without a matching `(`.
    #[error("unexpected ')' at token {0}")]
    UnexpectedClose(usize),
    /// An operator (`||`, `^^`, `??`, `flag?`) was not followed by `(`.
    #[error("'{operator}' at token {position} must be followed by '('")]
    MissingGroup {
        /// The dangling operator.
        operator: String,
        /// Token index.
        position: usize,
    },
    /// `^^` or `??` outside REQUIRED_USE.
    #[error("'{0}' is only permitted in REQUIRED_USE")]
    NotPermitted(String),
    /// A bare word in REQUIRED_USE was not a valid flag name.
    #[error("invalid USE flag '{0}'")]
    InvalidFlag(String),
    /// A leaf atom was rejected after parsing.
    #[error(transparent)]
    Atom(#[from] AtomError),
}

/// A violated graph invariant.
///
/// These indicate bugs in graph construction (or broken package data, for
/// self-loops) rather than legitimately unsatisfiable dependencies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// An edge from a node to itself was requested.
    #[error("self-dependency on node {0:?}")]
    SelfLoop(PackageId),
    /// An edge referenced a node that is not in the graph.
    #[error("node {0:?} is not in the graph")]
    MissingNode(PackageId),
    /// No topological order exists under the given edge filter.
    #[error("cycle detected: {cycle:?}")]
    CycleDetected {
        /// The nodes of one offending cycle, in edge order.
        cycle: Vec<PackageId>,
    },
}

/// A failure of the metadata provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// No record exists for the requested package.
    #[error("package not found: {0}")]
    PackageNotFound(String),
    /// The record exists but lacks a requested key.
    #[error("{cpv}: unknown metadata key '{key}'")]
    UnknownKey {
        /// The package queried.
        cpv: String,
        /// The missing key.
        key: String,
    },
}

/// A configuration document that could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML syntax or schema error.
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A package.use or accept-keywords key was not a valid atom.
    #[error("invalid atom in configuration: {0}")]
    Atom(#[from] AtomError),
}

/// A failure to invoke the build-script interpreter.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The phase could not be started at all.
    #[error("failed to run {phase} for {package}: {reason}")]
    Spawn {
        /// Package display name.
        package: String,
        /// Phase name.
        phase: String,
        /// Underlying reason.
        reason: String,
    },
    /// I/O error talking to the interpreter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
