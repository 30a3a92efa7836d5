//! Aggregator-side contracts.
//!
//! An aggregator owns an ordered match set and activates once every
//! predicate resolves to exactly one live unit. Its owner implements
//! [`AggregatorOps`] to receive the bind and unbind transitions.

use crate::unit::MatchedUnit;
use crate::BindError;

/// Handle to a declared aggregator, returned by
/// [`ComponentRegistry::begin_matching`](crate::ComponentRegistry::begin_matching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregatorId(pub(crate) u64);

/// Externally observable aggregator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// Waiting for every predicate to resolve to exactly one unit.
    Matching,
    /// A completion attempt is running its bind callbacks.
    Binding,
    /// An unbind cascade is running its callbacks.
    Unbinding,
    /// Every slot is resolved and the owner bind succeeded.
    Bound,
}

/// Lifecycle callbacks an aggregator owner implements.
///
/// Both callbacks run with the registry lock released; they may block,
/// allocate, or re-enter the registry (for example to register further
/// units or declare nested aggregators).
pub trait AggregatorOps: Send + Sync {
    /// Called when every predicate has resolved, with the matched units in
    /// predicate declaration order. Failure rolls the whole attempt back.
    fn bind(&self, units: &[MatchedUnit]) -> core::result::Result<(), BindError>;

    /// Called when the aggregator unbinds, before any unit's own unbind.
    fn unbind(&self);
}
