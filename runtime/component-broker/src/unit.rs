//! Unit-side contracts.
//!
//! A unit is an independently lifecycle-managed entity. Its owner
//! registers it with the registry, keeps ownership, and implements
//! [`UnitOps`] so the broker can bind and unbind it as part of an
//! aggregator's lifecycle.

use crate::aggregator::AggregatorId;
use crate::matching::NodeHandle;
use crate::BindError;

/// Handle to a registered unit, returned by
/// [`ComponentRegistry::register`](crate::ComponentRegistry::register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub(crate) u64);

/// Lifecycle callbacks a unit owner implements.
///
/// Both callbacks run with the registry lock released; they may block,
/// allocate, or re-enter the registry.
pub trait UnitOps: Send + Sync {
    /// Called while the claiming aggregator binds, in slot order.
    fn bind(&self, aggregator: AggregatorId) -> core::result::Result<(), BindError>;

    /// Called while the owning aggregator unbinds, in reverse slot order.
    fn unbind(&self, aggregator: AggregatorId);
}

/// One resolved slot handed to
/// [`AggregatorOps::bind`](crate::AggregatorOps::bind), in declaration
/// order of the predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedUnit {
    /// Registry handle of the resolved unit.
    pub unit: UnitId,
    /// Identity the unit registered under.
    pub identity: NodeHandle,
}
