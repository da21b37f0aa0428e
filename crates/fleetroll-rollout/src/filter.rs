//! Target filters.
//!
//! The engine never interprets a query string. It only combines queries
//! into conjunctions and disjunctions and hands the result to a
//! [`TargetMatcher`](crate::TargetMatcher).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A predicate over targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFilter {
    /// Opaque query evaluated by the matcher.
    Query(String),
    /// Matches when every member matches. Empty matches everything.
    All(Vec<TargetFilter>),
    /// Matches when any member matches. Empty matches nothing.
    Any(Vec<TargetFilter>),
}

impl TargetFilter {
    pub fn query(query: impl Into<String>) -> Self {
        Self::Query(query.into().trim().to_string())
    }

    /// The rollout's base filter narrowed by a group refinement.
    ///
    /// A blank refinement leaves the base filter unchanged, so groups
    /// without one share the same memoization key.
    pub fn for_group(base: &str, refinement: &str) -> Self {
        let base = Self::query(base);
        if refinement.trim().is_empty() {
            base
        } else {
            Self::All(vec![base, Self::query(refinement)])
        }
    }

    /// Targets matching `self` that also match at least one of `previous`.
    pub fn overlapping_with(&self, previous: &[TargetFilter]) -> Self {
        let mut earlier = previous.to_vec();
        earlier.sort();
        earlier.dedup();
        Self::All(vec![self.clone(), Self::Any(earlier)])
    }
}

impl fmt::Display for TargetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (members, op) = match self {
            Self::Query(q) => return write!(f, "({q})"),
            Self::All(members) => (members, " AND "),
            Self::Any(members) => (members, " OR "),
        };
        if members.is_empty() {
            return f.write_str(if op == " AND " { "TRUE" } else { "FALSE" });
        }
        f.write_str("[")?;
        for (i, member) in members.iter().enumerate() {
            if i > 0 {
                f.write_str(op)?;
            }
            write!(f, "{member}")?;
        }
        f.write_str("]")
    }
}
