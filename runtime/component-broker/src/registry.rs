//! Component registry and resolution engine.
//!
//! Holds every live unit and every aggregator behind one coarse lock.
//! Registration events are rare next to steady-state operation, so a
//! single mutex keeps the bookkeeping simple. Owner callbacks always run
//! with that lock released: an attempt claims its snapshot under the lock,
//! drops the lock for the bind callbacks, then re-acquires it and
//! re-validates the snapshot before committing.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::aggregator::{AggregatorId, AggregatorOps, AggregatorState};
use crate::matching::{MatchPredicate, MatchSet, NodeHandle};
use crate::unit::{MatchedUnit, UnitId, UnitOps};
use crate::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    /// Live and available to any aggregator.
    Registered,
    /// Reserved by an in-flight completion attempt.
    Claimed(AggregatorId),
    /// Part of a bound aggregator.
    Bound(AggregatorId),
}

struct UnitEntry {
    identity: NodeHandle,
    ops: Arc<dyn UnitOps>,
    state: UnitState,
}

struct AggregatorEntry {
    predicates: Vec<MatchPredicate>,
    ops: Arc<dyn AggregatorOps>,
    state: AggregatorState,
    /// One resolved unit per predicate while claimed or bound.
    slots: Vec<Option<UnitId>>,
    /// An ambiguous resolution has already been reported; skip it quietly
    /// until the resolution changes.
    ambiguity_reported: bool,
}

#[derive(Default)]
struct Inner {
    units: BTreeMap<UnitId, UnitEntry>,
    aggregators: BTreeMap<AggregatorId, AggregatorEntry>,
    next_unit: u64,
    next_aggregator: u64,
}

/// Snapshot of one resolved slot, held across the unlocked bind callbacks.
struct AttemptUnit {
    id: UnitId,
    identity: NodeHandle,
    ops: Arc<dyn UnitOps>,
}

/// A claimed completion attempt, executed with the lock released.
struct BindAttempt {
    aggregator: AggregatorId,
    ops: Arc<dyn AggregatorOps>,
    units: Vec<AttemptUnit>,
}

/// Outcome of resolving one aggregator's predicates against the registry.
enum Resolution {
    /// Some predicate has zero or several candidates.
    NotReady,
    /// Two predicates resolved to the same unit.
    Ambiguous(NodeHandle),
    /// Every predicate resolved to exactly one distinct unit.
    Ready(Vec<UnitId>),
}

/// Snapshot of a bound aggregator taken for an unbind cascade.
struct UnbindCascade {
    aggregator: AggregatorId,
    ops: Arc<dyn AggregatorOps>,
    /// Bound units in reverse slot order.
    units: Vec<(UnitId, Arc<dyn UnitOps>)>,
}

/// Component registry shared by unit owners and aggregator owners.
///
/// Explicitly constructed and explicitly owned; every operation goes
/// through a handle to one instance.
#[derive(Default)]
pub struct ComponentRegistry {
    inner: Mutex<Inner>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under `identity`.
    ///
    /// Triggers a resolution pass. If the completion attempt this
    /// registration enables fails, the unit is rolled back out and the
    /// attempt's error is returned; the owner may fix things and register
    /// again.
    pub fn register(&self, identity: NodeHandle, ops: Arc<dyn UnitOps>) -> Result<UnitId> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.units.values().any(|u| u.identity == identity) {
                return Err(BrokerError::AlreadyRegistered { identity });
            }
            let id = UnitId(inner.next_unit);
            inner.next_unit += 1;
            inner.units.insert(
                id,
                UnitEntry {
                    identity,
                    ops,
                    state: UnitState::Registered,
                },
            );
            id
        };
        debug!("unit {:?} registered as {:?}", identity, id);

        if let Err(err) = self.settle() {
            warn!("rolling back registration of {:?}: {}", identity, err);
            let _ = self.deregister(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Remove a registered unit.
    ///
    /// If the unit is part of a bound aggregator, the aggregator unbinds
    /// first: the owner's `unbind` runs, then every bound unit's `unbind`
    /// in reverse slot order, then the unit is removed. Completion
    /// attempts enabled by the removal are re-run; their failures are
    /// logged rather than returned, as there is nothing left to roll back.
    pub fn deregister(&self, unit: UnitId) -> Result<()> {
        self.remove_unit(unit)?;
        if let Err(err) = self.settle() {
            warn!("completion attempt after deregister failed: {err}");
        }
        Ok(())
    }

    /// Declare an aggregator over `match_set` and begin matching.
    ///
    /// Resolution against the live registry is attempted immediately; if
    /// the set is already complete the bind runs synchronously. On an
    /// immediate completion failure the aggregator is not retained and the
    /// bind result is returned.
    pub fn begin_matching(
        &self,
        match_set: MatchSet,
        ops: Arc<dyn AggregatorOps>,
    ) -> Result<AggregatorId> {
        let predicates = match_set.into_predicates();
        if predicates.is_empty() {
            // A predicate-less aggregator would bind vacuously and could
            // never be unbound through unit removal, leaving no legal path
            // to teardown.
            return Err(BrokerError::EmptyMatchSet);
        }
        let slots = predicates.len();
        let id = {
            let mut inner = self.inner.lock();
            let id = AggregatorId(inner.next_aggregator);
            inner.next_aggregator += 1;
            inner.aggregators.insert(
                id,
                AggregatorEntry {
                    predicates,
                    ops,
                    state: AggregatorState::Matching,
                    slots: vec![None; slots],
                    ambiguity_reported: false,
                },
            );
            id
        };
        debug!("aggregator {:?} matching {} predicate(s)", id, slots);

        if let Err(err) = self.settle() {
            let mut inner = self.inner.lock();
            match inner.aggregators.get(&id).map(|a| a.state) {
                Some(AggregatorState::Matching) | None => {
                    inner.aggregators.remove(&id);
                    warn!("aggregator {:?} not retained: {}", id, err);
                    return Err(err);
                }
                Some(_) => {
                    // The failure belongs to some other aggregator's
                    // attempt (a callback re-entered the registry); ours
                    // went through, so the caller keeps the handle.
                    warn!("unrelated completion attempt failed during begin_matching: {err}");
                }
            }
        }
        Ok(id)
    }

    /// Destroy an aggregator that is not bound.
    pub fn teardown(&self, aggregator: AggregatorId) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .aggregators
            .get(&aggregator)
            .map(|a| a.state)
            .ok_or(BrokerError::ComponentNotFound)?;
        if state != AggregatorState::Matching {
            return Err(BrokerError::TeardownWhileBound);
        }
        inner.aggregators.remove(&aggregator);
        debug!("aggregator {:?} torn down", aggregator);
        Ok(())
    }

    /// Number of live units.
    pub fn unit_count(&self) -> usize {
        self.inner.lock().units.len()
    }

    /// Number of declared aggregators.
    pub fn aggregator_count(&self) -> usize {
        self.inner.lock().aggregators.len()
    }

    /// Current state of an aggregator.
    pub fn aggregator_state(&self, aggregator: AggregatorId) -> Result<AggregatorState> {
        self.inner
            .lock()
            .aggregators
            .get(&aggregator)
            .map(|a| a.state)
            .ok_or(BrokerError::ComponentNotFound)
    }

    /// True if a unit is live under `identity`.
    pub fn is_registered(&self, identity: NodeHandle) -> bool {
        self.inner.lock().units.values().any(|u| u.identity == identity)
    }

    /// True if the unit is reserved by or bound to an aggregator.
    pub fn is_claimed(&self, unit: UnitId) -> Result<bool> {
        self.inner
            .lock()
            .units
            .get(&unit)
            .map(|u| u.state != UnitState::Registered)
            .ok_or(BrokerError::ComponentNotFound)
    }

    fn remove_unit(&self, unit: UnitId) -> Result<()> {
        loop {
            let cascade = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                let entry = inner.units.get(&unit).ok_or(BrokerError::ComponentNotFound)?;
                match entry.state {
                    UnitState::Registered => {
                        debug!("unit {:?} deregistered", entry.identity);
                        inner.units.remove(&unit);
                        return Ok(());
                    }
                    UnitState::Claimed(_) => {
                        // An in-flight attempt holds a snapshot reference;
                        // its re-validation will fail and unwind, running
                        // any callbacks it owes this unit.
                        debug!("unit {:?} deregistered mid-attempt", entry.identity);
                        inner.units.remove(&unit);
                        return Ok(());
                    }
                    UnitState::Bound(aggregator) => {
                        match Self::start_unbind(inner, aggregator) {
                            Some(cascade) => cascade,
                            None => {
                                // Another thread is already unwinding the
                                // aggregator and will run this unit's
                                // unbind through its own snapshot.
                                inner.units.remove(&unit);
                                return Ok(());
                            }
                        }
                    }
                }
            };
            self.run_unbind(cascade);
            // The unit reverted to Registered (or a racer removed it);
            // take another look.
        }
    }

    /// Move a bound aggregator to `Unbinding` and snapshot its cascade.
    fn start_unbind(inner: &mut Inner, aggregator: AggregatorId) -> Option<UnbindCascade> {
        let entry = inner.aggregators.get_mut(&aggregator)?;
        if entry.state != AggregatorState::Bound {
            return None;
        }
        entry.state = AggregatorState::Unbinding;
        let ops = Arc::clone(&entry.ops);
        let slots = entry.slots.clone();
        let mut units = Vec::with_capacity(slots.len());
        for slot in slots.iter().rev() {
            if let Some(id) = slot {
                if let Some(unit) = inner.units.get(id) {
                    units.push((*id, Arc::clone(&unit.ops)));
                }
            }
        }
        Some(UnbindCascade {
            aggregator,
            ops,
            units,
        })
    }

    /// Run an unbind cascade outside the lock and commit the reverted
    /// state. The owner's unbind runs strictly before any unit's unbind.
    fn run_unbind(&self, cascade: UnbindCascade) {
        debug!("aggregator {:?} unbinding", cascade.aggregator);
        cascade.ops.unbind();
        for (_, ops) in &cascade.units {
            ops.unbind(cascade.aggregator);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.aggregators.get_mut(&cascade.aggregator) {
            for slot in &mut entry.slots {
                *slot = None;
            }
            entry.state = AggregatorState::Matching;
        }
        for (id, _) in &cascade.units {
            if let Some(unit) = inner.units.get_mut(id) {
                if unit.state == UnitState::Bound(cascade.aggregator) {
                    unit.state = UnitState::Registered;
                }
            }
        }
        debug!("aggregator {:?} unbound", cascade.aggregator);
    }

    /// Re-scan matching aggregators until no further completion is
    /// possible, returning the first failed attempt to the caller.
    fn settle(&self) -> Result<()> {
        loop {
            let attempt = {
                let mut guard = self.inner.lock();
                match Self::claim_attempt(&mut guard)? {
                    Some(attempt) => attempt,
                    None => return Ok(()),
                }
            };
            self.run_bind(attempt)?;
            // The bind callbacks may have registered further units or
            // aggregators; scan again until the registry is quiet.
        }
    }

    /// Find one completable aggregator and claim its resolved units.
    ///
    /// Ambiguity is returned once per occurrence; a still-ambiguous
    /// aggregator is skipped on later passes so it cannot fail every
    /// subsequent registry event.
    fn claim_attempt(inner: &mut Inner) -> Result<Option<BindAttempt>> {
        let candidates: Vec<AggregatorId> = inner
            .aggregators
            .iter()
            .filter(|(_, a)| a.state == AggregatorState::Matching)
            .map(|(id, _)| *id)
            .collect();

        for id in candidates {
            let resolution = Self::resolve(inner, id);
            let Some(entry) = inner.aggregators.get_mut(&id) else {
                continue;
            };
            match resolution {
                Resolution::NotReady => {
                    entry.ambiguity_reported = false;
                }
                Resolution::Ambiguous(identity) => {
                    if entry.ambiguity_reported {
                        debug!("aggregator {:?} still ambiguous on {:?}", id, identity);
                    } else {
                        entry.ambiguity_reported = true;
                        warn!("aggregator {:?} ambiguous: two predicates match {:?}", id, identity);
                        return Err(BrokerError::MatchAmbiguous { identity });
                    }
                }
                Resolution::Ready(chosen) => {
                    entry.ambiguity_reported = false;
                    entry.state = AggregatorState::Binding;
                    for (slot, unit) in entry.slots.iter_mut().zip(&chosen) {
                        *slot = Some(*unit);
                    }
                    let ops = Arc::clone(&entry.ops);
                    let mut units = Vec::with_capacity(chosen.len());
                    for unit_id in &chosen {
                        if let Some(unit) = inner.units.get_mut(unit_id) {
                            unit.state = UnitState::Claimed(id);
                            units.push(AttemptUnit {
                                id: *unit_id,
                                identity: unit.identity,
                                ops: Arc::clone(&unit.ops),
                            });
                        }
                    }
                    return Ok(Some(BindAttempt {
                        aggregator: id,
                        ops,
                        units,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Resolve one aggregator's predicates against the live registry.
    ///
    /// A predicate resolves only when exactly one unclaimed unit matches;
    /// zero or several candidates leave the aggregator pending.
    fn resolve(inner: &Inner, aggregator: AggregatorId) -> Resolution {
        let Some(entry) = inner.aggregators.get(&aggregator) else {
            return Resolution::NotReady;
        };
        let mut chosen: Vec<UnitId> = Vec::with_capacity(entry.predicates.len());
        for predicate in &entry.predicates {
            let mut candidate = None;
            let mut hits = 0usize;
            for (id, unit) in &inner.units {
                if unit.state == UnitState::Registered && predicate.matches(unit.identity) {
                    hits += 1;
                    candidate = Some(*id);
                }
            }
            if hits != 1 {
                return Resolution::NotReady;
            }
            let Some(unit) = candidate else {
                return Resolution::NotReady;
            };
            if chosen.contains(&unit) {
                let identity = inner
                    .units
                    .get(&unit)
                    .map(|u| u.identity)
                    .unwrap_or(NodeHandle(0));
                return Resolution::Ambiguous(identity);
            }
            chosen.push(unit);
        }
        Resolution::Ready(chosen)
    }

    /// Execute a claimed attempt with the lock released: unit binds in
    /// slot order, then the owner bind, then re-validate and commit. Bind
    /// is all-or-nothing; any failure unwinds in reverse and releases
    /// every claim taken for the attempt.
    fn run_bind(&self, attempt: BindAttempt) -> Result<()> {
        let aggregator = attempt.aggregator;
        let matched: Vec<MatchedUnit> = attempt
            .units
            .iter()
            .map(|u| MatchedUnit {
                unit: u.id,
                identity: u.identity,
            })
            .collect();

        let mut units_bound = 0;
        let mut failure = None;
        for unit in &attempt.units {
            match unit.ops.bind(aggregator) {
                Ok(()) => units_bound += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let mut owner_bound = false;
        if failure.is_none() {
            match attempt.ops.bind(&matched) {
                Ok(()) => owner_bound = true,
                Err(err) => failure = Some(err),
            }
        }

        if let Some(err) = failure {
            for unit in attempt.units[..units_bound].iter().rev() {
                unit.ops.unbind(aggregator);
            }
            let mut guard = self.inner.lock();
            Self::release_claims(&mut guard, aggregator);
            warn!("bind of aggregator {:?} failed: {}; claims rolled back", aggregator, err);
            return Err(BrokerError::BindFailed {
                source: err,
                rolled_back: true,
            });
        }

        {
            let mut guard = self.inner.lock();
            if Self::commit_bound(&mut guard, &attempt) {
                debug!(
                    "aggregator {:?} bound with {} unit(s)",
                    aggregator,
                    attempt.units.len()
                );
                return Ok(());
            }
        }

        // A claimed unit deregistered while the callbacks ran; fold this
        // into a concurrent unbind and leave the aggregator matching.
        warn!("unit deregistered during bind of {:?}; attempt unwound", aggregator);
        if owner_bound {
            attempt.ops.unbind();
        }
        for unit in attempt.units.iter().rev() {
            unit.ops.unbind(aggregator);
        }
        let mut guard = self.inner.lock();
        Self::release_claims(&mut guard, aggregator);
        Ok(())
    }

    /// Re-validate an attempt snapshot and commit the bound state.
    fn commit_bound(inner: &mut Inner, attempt: &BindAttempt) -> bool {
        let all_live = attempt.units.iter().all(|u| {
            matches!(
                inner.units.get(&u.id),
                Some(entry) if entry.state == UnitState::Claimed(attempt.aggregator)
            )
        });
        if !all_live {
            return false;
        }
        for unit in &attempt.units {
            if let Some(entry) = inner.units.get_mut(&unit.id) {
                entry.state = UnitState::Bound(attempt.aggregator);
            }
        }
        if let Some(entry) = inner.aggregators.get_mut(&attempt.aggregator) {
            entry.state = AggregatorState::Bound;
        }
        true
    }

    /// Drop every claim held by `aggregator` and return it to matching.
    fn release_claims(inner: &mut Inner, aggregator: AggregatorId) {
        if let Some(entry) = inner.aggregators.get_mut(&aggregator) {
            for slot in &mut entry.slots {
                *slot = None;
            }
            entry.state = AggregatorState::Matching;
        }
        for unit in inner.units.values_mut() {
            if unit.state == UnitState::Claimed(aggregator) {
                unit.state = UnitState::Registered;
            }
        }
    }
}

impl Drop for ComponentRegistry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.units.is_empty() || !inner.aggregators.is_empty() {
            warn!(
                "registry dropped with {} unit(s) and {} aggregator(s) live",
                inner.units.len(),
                inner.aggregators.len()
            );
            debug_assert!(
                false,
                "registry torn down while units or aggregators remain"
            );
        }
    }
}
