//! Dependency-string and REQUIRED_USE trees.
//!
//! Dependency strings are parsed by [`DepEntry::parse`] and lowered into a
//! tree of [`DepNode`]s with [`Dep`] leaves. REQUIRED_USE has its own small
//! grammar here: [`FlagTerm`] leaves, bare `( )` groups and the `^^` / `??`
//! operators that dependency strings do not allow.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use portage_atom::{Dep, DepEntry};

use crate::atom::checked;
use crate::error::DepStringError;

/// One node of a parsed dependency tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepNode<L> {
    /// A single atom (or flag).
    Leaf(L),
    /// `( a b c )`: all children required.
    AllOf(Vec<DepNode<L>>),
    /// `|| ( a b c )`: at least one child.
    AnyOf(Vec<DepNode<L>>),
    /// `^^ ( a b c )`: exactly one child (REQUIRED_USE only).
    ExactlyOneOf(Vec<DepNode<L>>),
    /// `?? ( a b c )`: at most one child (REQUIRED_USE only).
    AtMostOneOf(Vec<DepNode<L>>),
    /// `flag? ( ... )` or `!flag? ( ... )`.
    UseConditional {
        /// Controlling flag.
        flag: String,
        /// `true` for `!flag?`.
        negate: bool,
        /// Children active when the condition holds.
        children: Vec<DepNode<L>>,
    },
}

/// A REQUIRED_USE leaf: `flag` or `!flag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagTerm {
    /// Flag name.
    pub flag: String,
    /// `true` for `!flag`.
    pub negate: bool,
}

impl FlagTerm {
    fn holds(&self, enabled: &impl Fn(&str) -> bool) -> bool {
        enabled(&self.flag) != self.negate
    }
}

/// Parse a DEPEND-style string (`DEPEND`, `RDEPEND`, `BDEPEND`, `PDEPEND`,
/// `IDEPEND`).
///
/// `^^` and `??` groups are rejected.
// TODO: keep bare `( )` groups nested in `||` as all-of branches once
// `DepEntry::parse` stops flattening them into the parent list.
pub fn parse_dependencies(input: &str) -> Result<Vec<DepNode<Dep>>, DepStringError> {
    lower(DepEntry::parse(input)?)
}

fn lower(entries: Vec<DepEntry>) -> Result<Vec<DepNode<Dep>>, DepStringError> {
    entries
        .into_iter()
        .map(|entry| {
            Ok(match entry {
                DepEntry::Atom(dep) => DepNode::Leaf(checked(dep)?),
                DepEntry::AnyOf(children) => DepNode::AnyOf(lower(children)?),
                DepEntry::UseConditional {
                    flag,
                    negate,
                    children,
                } => DepNode::UseConditional {
                    flag,
                    negate,
                    children: lower(children)?,
                },
                DepEntry::ExactlyOneOf(_) => return Err(DepStringError::NotPermitted("^^".into())),
                DepEntry::AtMostOneOf(_) => return Err(DepStringError::NotPermitted("??".into())),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Token<'a> {
    Open,
    Close,
    AnyOf,
    ExactlyOneOf,
    AtMostOneOf,
    Conditional { flag: &'a str, negate: bool },
    Word(&'a str),
}

/// PMS 3.1.4: `[A-Za-z0-9][A-Za-z0-9+_@-]*`.
fn is_valid_flag_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '@' | '-'))
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, DepStringError> {
    input
        .split_whitespace()
        .map(|word| {
            Ok(match word {
                "(" => Token::Open,
                ")" => Token::Close,
                "||" => Token::AnyOf,
                "^^" => Token::ExactlyOneOf,
                "??" => Token::AtMostOneOf,
                w if w.len() > 1 && w.ends_with('?') => {
                    let body = &w[..w.len() - 1];
                    let (flag, negate) = match body.strip_prefix('!') {
                        Some(f) => (f, true),
                        None => (body, false),
                    };
                    if !is_valid_flag_name(flag) {
                        return Err(DepStringError::InvalidFlag(flag.to_string()));
                    }
                    Token::Conditional { flag, negate }
                }
                w => Token::Word(w),
            })
        })
        .collect()
}

struct RequiredUseParser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl RequiredUseParser<'_> {
    fn sequence(&mut self, open: Option<usize>) -> Result<Vec<DepNode<FlagTerm>>, DepStringError> {
        let mut nodes = Vec::new();
        while let Some(token) = self.tokens.get(self.pos).copied() {
            let at = self.pos;
            self.pos += 1;
            let node = match token {
                Token::Close => {
                    return match open {
                        Some(_) => Ok(nodes),
                        None => Err(DepStringError::UnexpectedClose(at)),
                    };
                }
                Token::Open => DepNode::AllOf(self.sequence(Some(at))?),
                Token::AnyOf => DepNode::AnyOf(self.group("||", at)?),
                Token::ExactlyOneOf => DepNode::ExactlyOneOf(self.group("^^", at)?),
                Token::AtMostOneOf => DepNode::AtMostOneOf(self.group("??", at)?),
                Token::Conditional { flag, negate } => {
                    let operator = if negate {
                        format!("!{flag}?")
                    } else {
                        format!("{flag}?")
                    };
                    DepNode::UseConditional {
                        flag: flag.to_string(),
                        negate,
                        children: self.group(&operator, at)?,
                    }
                }
                Token::Word(word) => DepNode::Leaf(flag_term(word)?),
            };
            nodes.push(node);
        }
        match open {
            Some(at) => Err(DepStringError::UnclosedGroup(at)),
            None => Ok(nodes),
        }
    }

    fn group(&mut self, operator: &str, at: usize) -> Result<Vec<DepNode<FlagTerm>>, DepStringError> {
        match self.tokens.get(self.pos) {
            Some(Token::Open) => {
                let open = self.pos;
                self.pos += 1;
                self.sequence(Some(open))
            }
            _ => Err(DepStringError::MissingGroup {
                operator: operator.to_string(),
                position: at,
            }),
        }
    }
}

fn flag_term(word: &str) -> Result<FlagTerm, DepStringError> {
    let (flag, negate) = match word.strip_prefix('!') {
        Some(f) => (f, true),
        None => (word, false),
    };
    if !is_valid_flag_name(flag) {
        return Err(DepStringError::InvalidFlag(word.to_string()));
    }
    Ok(FlagTerm {
        flag: flag.to_string(),
        negate,
    })
}

/// Parse a REQUIRED_USE string.
pub fn parse_required_use(input: &str) -> Result<Vec<DepNode<FlagTerm>>, DepStringError> {
    RequiredUseParser {
        tokens: tokenize(input)?,
        pos: 0,
    }
    .sequence(None)
}

/// Evaluate USE conditionals, splicing active groups into their parent.
///
/// The result contains no [`DepNode::UseConditional`] nodes. Empty any-of
/// groups are kept (they are trivially satisfied).
pub fn reduce<L: Clone>(nodes: &[DepNode<L>], enabled: &impl Fn(&str) -> bool) -> Vec<DepNode<L>> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            DepNode::Leaf(l) => out.push(DepNode::Leaf(l.clone())),
            DepNode::AllOf(children) => out.push(DepNode::AllOf(reduce(children, enabled))),
            DepNode::AnyOf(children) => out.push(DepNode::AnyOf(reduce(children, enabled))),
            DepNode::ExactlyOneOf(children) => {
                out.push(DepNode::ExactlyOneOf(reduce(children, enabled)))
            }
            DepNode::AtMostOneOf(children) => {
                out.push(DepNode::AtMostOneOf(reduce(children, enabled)))
            }
            DepNode::UseConditional {
                flag,
                negate,
                children,
            } => {
                if enabled(flag) != *negate {
                    out.extend(reduce(children, enabled));
                }
            }
        }
    }
    out
}

/// Every leaf in the tree, regardless of conditionals.
pub fn leaves<L>(nodes: &[DepNode<L>]) -> Vec<&L> {
    fn walk<'a, L>(nodes: &'a [DepNode<L>], out: &mut Vec<&'a L>) {
        for node in nodes {
            match node {
                DepNode::Leaf(l) => out.push(l),
                DepNode::AllOf(c)
                | DepNode::AnyOf(c)
                | DepNode::ExactlyOneOf(c)
                | DepNode::AtMostOneOf(c)
                | DepNode::UseConditional { children: c, .. } => walk(c, out),
            }
        }
    }
    let mut out = Vec::new();
    walk(nodes, &mut out);
    out
}

/// Flags referenced by `flag?` conditionals.
pub fn conditional_flags<L>(nodes: &[DepNode<L>]) -> BTreeSet<String> {
    fn walk<L>(nodes: &[DepNode<L>], out: &mut BTreeSet<String>) {
        for node in nodes {
            match node {
                DepNode::Leaf(_) => {}
                DepNode::AllOf(c)
                | DepNode::AnyOf(c)
                | DepNode::ExactlyOneOf(c)
                | DepNode::AtMostOneOf(c) => walk(c, out),
                DepNode::UseConditional { flag, children, .. } => {
                    out.insert(flag.clone());
                    walk(children, out);
                }
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(nodes, &mut out);
    out
}

/// The `(flag, negate)` conditionals enclosing leaves that satisfy `pred`.
///
/// Only the innermost conditional of each matching leaf is reported, once.
pub fn enclosing_conditionals<L>(nodes: &[DepNode<L>], pred: &impl Fn(&L) -> bool) -> Vec<(String, bool)> {
    fn walk<L>(
        nodes: &[DepNode<L>],
        current: Option<(&str, bool)>,
        pred: &impl Fn(&L) -> bool,
        out: &mut Vec<(String, bool)>,
    ) {
        for node in nodes {
            match node {
                DepNode::Leaf(l) => {
                    if let Some((flag, negate)) = current {
                        if pred(l) && !out.iter().any(|(f, n)| f == flag && *n == negate) {
                            out.push((flag.to_string(), negate));
                        }
                    }
                }
                DepNode::AllOf(c)
                | DepNode::AnyOf(c)
                | DepNode::ExactlyOneOf(c)
                | DepNode::AtMostOneOf(c) => walk(c, current, pred, out),
                DepNode::UseConditional {
                    flag,
                    negate,
                    children,
                } => walk(children, Some((flag.as_str(), *negate)), pred, out),
            }
        }
    }
    let mut out = Vec::new();
    walk(nodes, None, pred, &mut out);
    out
}

fn node_satisfied(node: &DepNode<FlagTerm>, enabled: &impl Fn(&str) -> bool) -> bool {
    let count = |children: &[DepNode<FlagTerm>]| {
        children
            .iter()
            .filter(|c| node_satisfied(c, enabled))
            .count()
    };
    match node {
        DepNode::Leaf(term) => term.holds(enabled),
        DepNode::AllOf(c) => c.iter().all(|n| node_satisfied(n, enabled)),
        DepNode::AnyOf(c) => c.is_empty() || count(c) >= 1,
        DepNode::ExactlyOneOf(c) => c.is_empty() || count(c) == 1,
        DepNode::AtMostOneOf(c) => count(c) <= 1,
        DepNode::UseConditional {
            flag,
            negate,
            children,
        } => enabled(flag) == *negate || children.iter().all(|n| node_satisfied(n, enabled)),
    }
}

/// Whether a REQUIRED_USE tree holds for the given USE state.
pub fn required_use_satisfied(nodes: &[DepNode<FlagTerm>], enabled: &impl Fn(&str) -> bool) -> bool {
    nodes.iter().all(|n| node_satisfied(n, enabled))
}

/// The top-level REQUIRED_USE clauses that fail, rendered for display.
pub fn unsatisfied_clauses(nodes: &[DepNode<FlagTerm>], enabled: &impl Fn(&str) -> bool) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| !node_satisfied(n, enabled))
        .map(|n| n.to_string())
        .collect()
}

/// Search for the smallest set of flag flips (one or two flags, restricted to
/// `changeable`) that makes REQUIRED_USE hold.
///
/// Every single flip is tried before any pair. Returns the flips as
/// `flag -> new state`.
pub fn suggest_required_use_fix(
    nodes: &[DepNode<FlagTerm>],
    enabled: &BTreeSet<String>,
    changeable: &BTreeSet<String>,
) -> Option<BTreeMap<String, bool>> {
    let mut mentioned: BTreeSet<String> = leaves(nodes).into_iter().map(|t| t.flag.clone()).collect();
    mentioned.extend(conditional_flags(nodes));
    let candidates: Vec<&String> = mentioned.iter().filter(|f| changeable.contains(*f)).collect();

    let holds_with = |flips: &[&String]| {
        let state = |flag: &str| {
            let on = enabled.contains(flag);
            if flips.iter().any(|f| f.as_str() == flag) { !on } else { on }
        };
        required_use_satisfied(nodes, &state)
    };
    let to_map = |flips: &[&String]| {
        flips
            .iter()
            .map(|f| ((*f).clone(), !enabled.contains(f.as_str())))
            .collect::<BTreeMap<_, _>>()
    };

    if let Some(&a) = candidates.iter().find(|&&a| holds_with(&[a])) {
        return Some(to_map(&[a]));
    }
    for (i, &a) in candidates.iter().enumerate() {
        for &b in &candidates[i + 1..] {
            if holds_with(&[a, b]) {
                return Some(to_map(&[a, b]));
            }
        }
    }
    None
}

impl fmt::Display for FlagTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "!")?;
        }
        write!(f, "{}", self.flag)
    }
}

fn write_group<L: fmt::Display>(f: &mut fmt::Formatter<'_>, prefix: &str, children: &[DepNode<L>]) -> fmt::Result {
    write!(f, "{prefix}(")?;
    for child in children {
        write!(f, " {child}")?;
    }
    write!(f, " )")
}

impl<L: fmt::Display> fmt::Display for DepNode<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepNode::Leaf(l) => write!(f, "{l}"),
            DepNode::AllOf(c) => write_group(f, "", c),
            DepNode::AnyOf(c) => write_group(f, "|| ", c),
            DepNode::ExactlyOneOf(c) => write_group(f, "^^ ", c),
            DepNode::AtMostOneOf(c) => write_group(f, "?? ", c),
            DepNode::UseConditional {
                flag,
                negate,
                children,
            } => {
                let bang = if *negate { "!" } else { "" };
                write_group(f, &format!("{bang}{flag}? "), children)
            }
        }
    }
}

/// Render a whole tree back to its string form.
pub fn render<L: fmt::Display>(nodes: &[DepNode<L>]) -> String {
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
