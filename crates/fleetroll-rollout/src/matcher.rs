//! Target matching.
//!
//! [`TargetMatcher`] is the only way the engine learns which targets a
//! filter selects. [`StoreTargetMatcher`] evaluates filters against the
//! target registry held in the [`StateStore`].
//!
//! # Query grammar
//!
//! A leaf query is blank or `*` (everything), or a `,`-separated list of
//! alternatives, each a `;`-separated list of terms. A term is
//! `key==value` or `key!=value`; a value ending in `*` matches by prefix.
//! The key `id` addresses the target id, any other key a target attribute.

use fleetroll_state::{GroupId, StateError, StateStore, Target, TargetId};
use thiserror::Error;

use crate::filter::TargetFilter;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid target query `{query}`: {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error(transparent)]
    Store(#[from] StateError),
}

/// Counts and pages targets selected by a filter.
///
/// `excluded` names rollout groups whose members are left out.
pub trait TargetMatcher: Send + Sync {
    fn count_matching(&self, filter: &TargetFilter) -> Result<u64, MatchError>;

    fn count_matching_excluding(
        &self,
        filter: &TargetFilter,
        excluded: &[GroupId],
    ) -> Result<u64, MatchError>;

    /// Matching targets in a stable order, skipping `offset` and returning
    /// at most `limit`.
    fn page_matching_excluding(
        &self,
        filter: &TargetFilter,
        excluded: &[GroupId],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetId>, MatchError>;
}

/// Matcher over the targets registered in the store.
#[derive(Clone)]
pub struct StoreTargetMatcher {
    store: StateStore,
}

impl StoreTargetMatcher {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Targets matching `filter`, in id order, minus members of `excluded`.
    fn select(&self, filter: &TargetFilter, excluded: &[GroupId]) -> Result<Vec<Target>, MatchError> {
        let compiled = Compiled::from_filter(filter)?;
        let grouped = self.store.grouped_target_ids(excluded)?;
        Ok(self
            .store
            .list_targets()?
            .into_iter()
            .filter(|t| !grouped.contains(&t.id) && compiled.matches(t))
            .collect())
    }
}

impl TargetMatcher for StoreTargetMatcher {
    fn count_matching(&self, filter: &TargetFilter) -> Result<u64, MatchError> {
        self.count_matching_excluding(filter, &[])
    }

    fn count_matching_excluding(
        &self,
        filter: &TargetFilter,
        excluded: &[GroupId],
    ) -> Result<u64, MatchError> {
        Ok(self.select(filter, excluded)?.len() as u64)
    }

    fn page_matching_excluding(
        &self,
        filter: &TargetFilter,
        excluded: &[GroupId],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetId>, MatchError> {
        Ok(self
            .select(filter, excluded)?
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|t| t.id)
            .collect())
    }
}

/// Check a query parses, without evaluating it.
pub fn parse_query(query: &str) -> Result<(), MatchError> {
    Leaf::parse(query).map(|_| ())
}

// ── Compilation ────────────────────────────────────────────────────

enum Compiled {
    Leaf(Leaf),
    All(Vec<Compiled>),
    Any(Vec<Compiled>),
}

impl Compiled {
    fn from_filter(filter: &TargetFilter) -> Result<Self, MatchError> {
        Ok(match filter {
            TargetFilter::Query(q) => Self::Leaf(Leaf::parse(q)?),
            TargetFilter::All(members) => {
                Self::All(members.iter().map(Self::from_filter).collect::<Result<_, _>>()?)
            }
            TargetFilter::Any(members) => {
                Self::Any(members.iter().map(Self::from_filter).collect::<Result<_, _>>()?)
            }
        })
    }

    fn matches(&self, target: &Target) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.matches(target),
            Self::All(members) => members.iter().all(|m| m.matches(target)),
            Self::Any(members) => members.iter().any(|m| m.matches(target)),
        }
    }
}

/// Disjunction of conjunctions. No alternatives means "match everything".
struct Leaf {
    alternatives: Vec<Vec<Term>>,
}

struct Term {
    key: String,
    pattern: Pattern,
    negated: bool,
}

enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Leaf {
    fn parse(query: &str) -> Result<Self, MatchError> {
        let query = query.trim();
        if query.is_empty() || query == "*" {
            return Ok(Self {
                alternatives: Vec::new(),
            });
        }
        let invalid = |reason: &str| MatchError::InvalidQuery {
            query: query.to_string(),
            reason: reason.to_string(),
        };

        let mut alternatives = Vec::new();
        for alternative in query.split(',') {
            let mut terms = Vec::new();
            for raw in alternative.split(';').map(str::trim).filter(|t| !t.is_empty()) {
                let (key, value, negated) = if let Some((k, v)) = raw.split_once("!=") {
                    (k, v, true)
                } else if let Some((k, v)) = raw.split_once("==") {
                    (k, v, false)
                } else {
                    return Err(invalid(&format!("term `{raw}` has no == or != operator")));
                };
                let key = key.trim();
                if key.is_empty() || key.contains(['=', '!']) {
                    return Err(invalid(&format!("term `{raw}` has a malformed key")));
                }
                let value = value.trim();
                let pattern = match value.strip_suffix('*') {
                    Some(prefix) => Pattern::Prefix(prefix.to_string()),
                    None => Pattern::Exact(value.to_string()),
                };
                terms.push(Term {
                    key: key.to_string(),
                    pattern,
                    negated,
                });
            }
            if terms.is_empty() {
                return Err(invalid("empty alternative"));
            }
            alternatives.push(terms);
        }
        Ok(Self { alternatives })
    }

    fn matches(&self, target: &Target) -> bool {
        self.alternatives.is_empty()
            || self
                .alternatives
                .iter()
                .any(|terms| terms.iter().all(|term| term.matches(target)))
    }
}

impl Term {
    fn matches(&self, target: &Target) -> bool {
        let value = if self.key == "id" {
            Some(target.id.as_str())
        } else {
            target.attributes.get(&self.key).map(String::as_str)
        };
        let hit = value.is_some_and(|v| match &self.pattern {
            Pattern::Exact(expected) => v == expected,
            Pattern::Prefix(prefix) => v.starts_with(prefix.as_str()),
        });
        hit != self.negated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetroll_state::GroupMembership;

    fn seeded_store() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for (id, region, hw) in [
            ("dev-01", "eu", "v1"),
            ("dev-02", "eu", "v2"),
            ("dev-03", "us", "v2"),
            ("gw-01", "us", "v1"),
        ] {
            store
                .put_target(
                    &Target::new(id)
                        .with_attribute("region", region)
                        .with_attribute("hw", hw),
                )
                .unwrap();
        }
        store.put_target(&Target::new("bare")).unwrap();
        store
    }

    fn ids(matcher: &StoreTargetMatcher, query: &str) -> Vec<TargetId> {
        matcher
            .page_matching_excluding(&TargetFilter::query(query), &[], 0, 100)
            .unwrap()
    }

    #[test]
    fn wildcard_and_blank_match_everything() {
        let matcher = StoreTargetMatcher::new(seeded_store());
        assert_eq!(matcher.count_matching(&TargetFilter::query("*")).unwrap(), 5);
        assert_eq!(matcher.count_matching(&TargetFilter::query("")).unwrap(), 5);
    }

    #[test]
    fn terms_alternatives_and_prefixes() {
        let matcher = StoreTargetMatcher::new(seeded_store());
        assert_eq!(ids(&matcher, "region==eu"), vec!["dev-01", "dev-02"]);
        assert_eq!(ids(&matcher, "region==us;hw==v2"), vec!["dev-03"]);
        assert_eq!(ids(&matcher, "hw==v2, id==gw-01"), vec!["dev-02", "dev-03", "gw-01"]);
        assert_eq!(ids(&matcher, "id==dev-*"), vec!["dev-01", "dev-02", "dev-03"]);
    }

    #[test]
    fn missing_attribute_fails_eq_passes_ne() {
        let matcher = StoreTargetMatcher::new(seeded_store());
        assert!(!ids(&matcher, "region==eu").contains(&"bare".to_string()));
        assert_eq!(ids(&matcher, "region!=eu"), vec!["bare", "dev-03", "gw-01"]);
    }

    #[test]
    fn malformed_query_is_rejected() {
        let matcher = StoreTargetMatcher::new(seeded_store());
        let err = matcher
            .count_matching(&TargetFilter::query("region=eu"))
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidQuery { .. }));
        assert!(parse_query("==eu").is_err());
        assert!(parse_query("region==eu,").is_err());
        assert!(parse_query("region==eu").is_ok());
    }

    #[test]
    fn combinators_compose_leaves() {
        let matcher = StoreTargetMatcher::new(seeded_store());
        let eu_or_v1 = TargetFilter::Any(vec![
            TargetFilter::query("region==eu"),
            TargetFilter::query("hw==v1"),
        ]);
        assert_eq!(matcher.count_matching(&eu_or_v1).unwrap(), 3);
        let nothing = TargetFilter::All(vec![
            TargetFilter::query("*"),
            TargetFilter::Any(vec![]),
        ]);
        assert_eq!(matcher.count_matching(&nothing).unwrap(), 0);
    }

    #[test]
    fn excludes_members_of_named_groups() {
        let store = seeded_store();
        store
            .write(|txn| {
                txn.insert_membership(&GroupMembership {
                    rollout_id: 1,
                    group_id: 7,
                    target_id: "dev-01".to_string(),
                    assigned_at: 0,
                })
            })
            .unwrap();
        let matcher = StoreTargetMatcher::new(store);
        let all = TargetFilter::query("*");
        assert_eq!(matcher.count_matching_excluding(&all, &[7]).unwrap(), 4);
        assert_eq!(matcher.count_matching_excluding(&all, &[8]).unwrap(), 5);
        assert_eq!(
            matcher.page_matching_excluding(&all, &[7], 1, 2).unwrap(),
            vec!["dev-02", "dev-03"]
        );
    }
}
