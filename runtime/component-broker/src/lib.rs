//! Component Broker - dependency-gated component binding
//!
//! # Purpose
//! Independently probed units register themselves with a shared registry.
//! An aggregator declares the set of units it needs as an ordered list of
//! match predicates and activates only once every predicate resolves to
//! exactly one live unit, unwinding safely when any required unit
//! disappears.
//!
//! # Integration Points
//! - Depends on: nothing below std; callers supply opaque topology keys
//! - Provides to: subsystems assembled from independently probed parts
//! - Callbacks: owner-supplied bind/unbind ops, always invoked with the
//!   registry lock released
//!
//! # Architecture
//! - One coarse lock over the unit table and every aggregator
//! - Resolution re-scans pending aggregators on each registry event
//! - Claims are finalized only after a successful all-or-nothing bind
//!
//! # Testing Strategy
//! - Unit tests: predicate matching, registry bookkeeping, rollback paths
//! - Integration tests: bind/unbind cascades, rebinding, concurrent churn

mod aggregator;
mod matching;
mod registry;
mod unit;

pub use aggregator::{AggregatorId, AggregatorOps, AggregatorState};
pub use matching::{MatchPredicate, MatchSet, NodeHandle};
pub use registry::ComponentRegistry;
pub use unit::{MatchedUnit, UnitId, UnitOps};

use thiserror::Error;

/// Error returned by owner-supplied bind callbacks.
///
/// Owners describe the failure; the broker wraps it in
/// [`BrokerError::BindFailed`] after rolling the attempt back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BindError(pub String);

impl BindError {
    /// Create a bind error from any printable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Broker error types
#[derive(Debug, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("identity {identity:?} is already registered")]
    AlreadyRegistered { identity: NodeHandle },

    #[error("component not found")]
    ComponentNotFound,

    #[error("two predicates resolve to the unit registered as {identity:?}")]
    MatchAmbiguous { identity: NodeHandle },

    #[error("component bind failed: {source}")]
    BindFailed {
        source: BindError,
        /// Every unit claimed for the failed attempt was released.
        rolled_back: bool,
    },

    #[error("aggregator is bound or mid-transition; it must be unbound first")]
    TeardownWhileBound,

    #[error("a match set must declare at least one predicate")]
    EmptyMatchSet,
}

pub type Result<T> = core::result::Result<T, BrokerError>;
