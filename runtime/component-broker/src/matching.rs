//! Match predicates and ordered match sets.
//!
//! An aggregator names the units it needs as an ordered list of
//! predicates. Each predicate carries an opaque topology key and a
//! comparator over unit identities; declaration order fixes slot indexing
//! in the bound-unit list handed to the aggregator owner.

use std::fmt;

/// Opaque topology node handle.
///
/// Units register under one and predicates compare against one. The value
/// comes from whatever enumeration service the caller uses; the broker
/// never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

type CompareFn = Box<dyn Fn(NodeHandle) -> bool + Send + Sync>;

/// A single match rule: an opaque comparison key plus a comparator run
/// against every live unit identity during resolution.
pub struct MatchPredicate {
    key: NodeHandle,
    compare: CompareFn,
}

impl MatchPredicate {
    /// Create a predicate from a key and comparator.
    pub fn new(key: NodeHandle, compare: impl Fn(NodeHandle) -> bool + Send + Sync + 'static) -> Self {
        Self {
            key,
            compare: Box::new(compare),
        }
    }

    /// Predicate matching exactly the unit registered under `key`.
    pub fn identity(key: NodeHandle) -> Self {
        Self::new(key, move |candidate| candidate == key)
    }

    /// The opaque comparison key this predicate was declared with.
    pub fn key(&self) -> NodeHandle {
        self.key
    }

    pub(crate) fn matches(&self, identity: NodeHandle) -> bool {
        (self.compare)(identity)
    }
}

impl fmt::Debug for MatchPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchPredicate")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Ordered list of predicates declared by one aggregator owner.
///
/// Built incrementally; each `add` appends one slot.
#[derive(Debug, Default)]
pub struct MatchSet {
    predicates: Vec<MatchPredicate>,
}

impl MatchSet {
    /// Create an empty match set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a predicate. Declaration order determines slot indexing.
    pub fn add(&mut self, predicate: MatchPredicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    /// Append an identity-equality predicate for `key`.
    pub fn add_identity(&mut self, key: NodeHandle) -> &mut Self {
        self.add(MatchPredicate::identity(key))
    }

    /// Number of declared predicates.
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// True if no predicate has been declared.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub(crate) fn into_predicates(self) -> Vec<MatchPredicate> {
        self.predicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_predicate_matches_only_its_key() {
        let pred = MatchPredicate::identity(NodeHandle(7));
        assert!(pred.matches(NodeHandle(7)));
        assert!(!pred.matches(NodeHandle(8)));
        assert_eq!(pred.key(), NodeHandle(7));
    }

    #[test]
    fn test_custom_comparator() {
        let pred = MatchPredicate::new(NodeHandle(0), |id| id.0 % 2 == 0);
        assert!(pred.matches(NodeHandle(4)));
        assert!(!pred.matches(NodeHandle(5)));
    }

    #[test]
    fn test_match_set_preserves_declaration_order() {
        let mut set = MatchSet::new();
        set.add_identity(NodeHandle(3));
        set.add_identity(NodeHandle(1));
        set.add_identity(NodeHandle(2));
        assert_eq!(set.len(), 3);

        let keys: Vec<u64> = set.into_predicates().iter().map(|p| p.key().0).collect();
        assert_eq!(keys, vec![3, 1, 2]);
    }
}
