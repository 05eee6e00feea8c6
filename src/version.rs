//! Version comparison and PMS operator matching.
//!
//! PMS 3.3 ordering, applied to both raw strings ([`vercmp`]) and parsed
//! [`Version`]s ([`compare_versions`]):
//!
//! - the first numeric component compares as an integer;
//! - a later component compares as a fraction (trailing zeros stripped,
//!   then as a string) when either side has a leading `0`, otherwise as an
//!   integer;
//! - with an equal shared prefix the longer component list is greater, so
//!   `1.0 < 1.0.0`;
//! - then the letter, then `_alpha < _beta < _pre < _rc < (none) < _p`,
//!   then the revision.
//!
//! `Version`'s own `Ord` pads missing components with zeros and is only used
//! here for `=ver*` prefix matching.

use std::cmp::Ordering;

use portage_atom::{Operator, SuffixKind, Version};

use crate::error::AtomError;

/// Compare two version strings.
///
/// Leading zeros are significant (`1.01 < 1.1`); `1.0` and `1.0-r0` compare
/// equal.
pub fn vercmp(a: &str, b: &str) -> Result<Ordering, AtomError> {
    let (a, b) = (a.trim(), b.trim());
    let (va, vb) = (parse_version(a)?, parse_version(b)?);
    Ok(compare_parts(&raw_components(a), &va, &raw_components(b), &vb))
}

/// Compare two parsed versions.
///
/// Components are compared as the integers `Version` stores, so leading
/// zeros written in the source are not visible here.
pub fn compare_versions(a: &Version, b: &Version) -> Ordering {
    compare_parts(&components(a), a, &components(b), b)
}

/// Parse a version string, normalizing an explicit `-r0` away.
pub fn parse_version(s: &str) -> Result<Version, AtomError> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_suffix("-r0").unwrap_or(trimmed);
    Version::parse(trimmed).map_err(|_| AtomError::InvalidVersion(s.to_string()))
}

/// The dotted numeric prefix of a version string, as written.
fn raw_components(s: &str) -> Vec<&str> {
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    s[..end].split('.').collect()
}

fn components(v: &Version) -> Vec<String> {
    v.numbers.iter().map(u64::to_string).collect()
}

fn compare_parts<S: AsRef<str>>(a_nums: &[S], a: &Version, b_nums: &[S], b: &Version) -> Ordering {
    compare_components(a_nums, b_nums)
        .then_with(|| a.letter.cmp(&b.letter))
        .then_with(|| compare_suffixes(a, b))
        .then_with(|| a.revision.0.cmp(&b.revision.0))
}

fn compare_components<S: AsRef<str>>(a: &[S], b: &[S]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let (x, y) = (x.as_ref(), y.as_ref());
        let ord = if i > 0 && (x.starts_with('0') || y.starts_with('0')) {
            x.trim_end_matches('0').cmp(y.trim_end_matches('0'))
        } else {
            compare_integers(x, y)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Compare digit strings of any length as integers.
fn compare_integers(x: &str, y: &str) -> Ordering {
    let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}

fn suffix_rank(kind: SuffixKind) -> i8 {
    match kind {
        SuffixKind::Alpha => -4,
        SuffixKind::Beta => -3,
        SuffixKind::Pre => -2,
        SuffixKind::Rc => -1,
        SuffixKind::P => 1,
    }
}

fn compare_suffixes(a: &Version, b: &Version) -> Ordering {
    for i in 0..a.suffixes.len().max(b.suffixes.len()) {
        let ord = match (a.suffixes.get(i), b.suffixes.get(i)) {
            (Some(x), Some(y)) => suffix_rank(x.kind)
                .cmp(&suffix_rank(y.kind))
                .then_with(|| x.version.unwrap_or(0).cmp(&y.version.unwrap_or(0))),
            (Some(x), None) => suffix_rank(x.kind).cmp(&0),
            (None, Some(y)) => 0.cmp(&suffix_rank(y.kind)),
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Test whether `candidate` satisfies the version constraint `op constraint`.
///
/// | Operator | Meaning |
/// |----------|---------|
/// | `<`  | strictly less |
/// | `<=` | less or equal |
/// | `=`  | equal including revision; prefix match when `constraint.glob` |
/// | `>=` | greater or equal |
/// | `>`  | strictly greater |
/// | `~`  | same version ignoring revision |
pub fn version_matches(candidate: &Version, op: &Operator, constraint: &Version) -> bool {
    let ord = compare_versions(candidate, constraint);
    match op {
        Operator::Less => ord == Ordering::Less,
        Operator::LessOrEqual => ord != Ordering::Greater,
        Operator::Equal if constraint.glob => candidate.cmp(constraint) == Ordering::Equal,
        Operator::Equal => ord == Ordering::Equal,
        Operator::GreaterOrEqual => ord != Ordering::Less,
        Operator::Greater => ord == Ordering::Greater,
        Operator::Approximate => compare_versions(&candidate.base(), &constraint.base()) == Ordering::Equal,
    }
}

/// A [`Version`] ordered by [`compare_versions`], for sort keys.
#[derive(Debug, Clone)]
pub struct PmsOrder<'a>(pub &'a Version);

impl PartialEq for PmsOrder<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PmsOrder<'_> {}

impl PartialOrd for PmsOrder<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PmsOrder<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(self.0, other.0)
    }
}
