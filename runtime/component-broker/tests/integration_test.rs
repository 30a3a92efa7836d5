//! Integration tests for the component broker
//!
//! These tests exercise the end-to-end workflows:
//! - Declaring an aggregator and binding as units arrive in any order
//! - Unbind cascades and rebinding after a replacement unit appears
//! - Completion fences signalled from an aggregator bind
//! - Concurrent registration churn against one aggregator

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use component_broker::{
    AggregatorId, AggregatorOps, AggregatorState, BindError, ComponentRegistry, MatchPredicate,
    MatchSet, MatchedUnit, NodeHandle, UnitId, UnitOps,
};
use completion_fence::{context_alloc, Fence, WaitStatus};

/// Unit ops that count bind/unbind calls.
#[derive(Default)]
struct CountingUnit {
    binds: AtomicUsize,
    unbinds: AtomicUsize,
}

impl UnitOps for CountingUnit {
    fn bind(&self, _aggregator: AggregatorId) -> Result<(), BindError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unbind(&self, _aggregator: AggregatorId) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

/// Aggregator ops that count transitions and remember the last bound set.
#[derive(Default)]
struct CountingOwner {
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    last_bound: parking_lot::Mutex<Vec<u64>>,
}

impl AggregatorOps for CountingOwner {
    fn bind(&self, units: &[MatchedUnit]) -> Result<(), BindError> {
        *self.last_bound.lock() = units.iter().map(|u| u.identity.0).collect();
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

fn identity_set(keys: &[u64]) -> MatchSet {
    let mut set = MatchSet::new();
    for key in keys {
        set.add_identity(NodeHandle(*key));
    }
    set
}

/// Full lifecycle: pending aggregator, out-of-order arrival, unbind on
/// loss, rebind once a replacement registers.
#[test]
fn test_full_bind_unbind_rebind_workflow() {
    let registry = ComponentRegistry::new();
    let owner = Arc::new(CountingOwner::default());

    let mut set = MatchSet::new();
    set.add(MatchPredicate::new(NodeHandle(0), |id| id.0 < 100));
    set.add_identity(NodeHandle(200));
    let agg = registry
        .begin_matching(set, owner.clone())
        .expect("declare aggregator");

    let b = registry
        .register(NodeHandle(200), Arc::new(CountingUnit::default()))
        .expect("register b");
    assert_eq!(registry.aggregator_state(agg), Ok(AggregatorState::Matching));

    let a = registry
        .register(NodeHandle(1), Arc::new(CountingUnit::default()))
        .expect("register a");
    assert_eq!(registry.aggregator_state(agg), Ok(AggregatorState::Bound));
    assert_eq!(*owner.last_bound.lock(), vec![1, 200]);

    registry.deregister(a).expect("deregister a");
    assert_eq!(registry.aggregator_state(agg), Ok(AggregatorState::Matching));
    assert_eq!(owner.unbinds.load(Ordering::SeqCst), 1);

    let c = registry
        .register(NodeHandle(2), Arc::new(CountingUnit::default()))
        .expect("register c");
    assert_eq!(registry.aggregator_state(agg), Ok(AggregatorState::Bound));
    assert_eq!(*owner.last_bound.lock(), vec![2, 200]);
    assert_eq!(owner.binds.load(Ordering::SeqCst), 2);

    registry.deregister(c).expect("deregister c");
    registry.deregister(b).expect("deregister b");
    registry.teardown(agg).expect("teardown");
}

/// An aggregator bind signals a completion fence so consumers elsewhere
/// can await subsystem readiness.
struct FenceOwner {
    ready: Fence,
}

impl AggregatorOps for FenceOwner {
    fn bind(&self, _units: &[MatchedUnit]) -> Result<(), BindError> {
        self.ready.signal();
        Ok(())
    }

    fn unbind(&self) {}
}

#[test]
fn test_aggregator_bind_signals_readiness_fence() {
    let registry = ComponentRegistry::new();
    let ready = Fence::new(context_alloc(), 1);
    let agg = registry
        .begin_matching(
            identity_set(&[7]),
            Arc::new(FenceOwner {
                ready: ready.acquire(),
            }),
        )
        .expect("declare aggregator");
    assert_eq!(ready.wait(Duration::ZERO), WaitStatus::TimedOut);

    let unit = registry
        .register(NodeHandle(7), Arc::new(CountingUnit::default()))
        .expect("register unit");
    assert_eq!(
        ready.wait(Duration::from_millis(100)),
        WaitStatus::Signaled
    );

    registry.deregister(unit).expect("deregister");
    registry.teardown(agg).expect("teardown");
}

/// Concurrent registration churn: two threads toggle the units an
/// aggregator needs while two more churn unrelated identities. Every
/// owner bind is eventually paired with exactly one owner unbind, and the
/// registry ends consistent.
#[test]
fn test_concurrent_registration_churn() {
    let registry = Arc::new(ComponentRegistry::new());
    let owner = Arc::new(CountingOwner::default());
    let unit_calls = Arc::new(CountingUnit::default());

    let agg = registry
        .begin_matching(identity_set(&[1, 2]), owner.clone())
        .expect("declare aggregator");

    crossbeam::scope(|scope| {
        for identity in [1u64, 2u64] {
            let registry = Arc::clone(&registry);
            let ops = Arc::clone(&unit_calls);
            scope.spawn(move |_| {
                for _ in 0..50 {
                    let unit = registry
                        .register(NodeHandle(identity), ops.clone())
                        .expect("bind callbacks in this test never fail");
                    registry.deregister(unit).expect("deregister");
                }
            });
        }
        for identity in [100u64, 101u64] {
            let registry = Arc::clone(&registry);
            scope.spawn(move |_| {
                for _ in 0..50 {
                    let unit = registry
                        .register(NodeHandle(identity), Arc::new(CountingUnit::default()))
                        .expect("unrelated registration never completes a match");
                    registry.deregister(unit).expect("deregister unrelated");
                }
            });
        }
    })
    .expect("churn threads");

    assert_eq!(registry.aggregator_state(agg), Ok(AggregatorState::Matching));
    assert_eq!(registry.unit_count(), 0);
    assert_eq!(
        owner.binds.load(Ordering::SeqCst),
        owner.unbinds.load(Ordering::SeqCst)
    );
    assert_eq!(
        unit_calls.binds.load(Ordering::SeqCst),
        unit_calls.unbinds.load(Ordering::SeqCst)
    );

    registry.teardown(agg).expect("teardown");
}

/// An aggregator owner may register further units from inside its bind
/// callback; the lock is not held across callbacks.
struct ReentrantOwner {
    registry: parking_lot::Mutex<Option<Arc<ComponentRegistry>>>,
    spawned: parking_lot::Mutex<Option<UnitId>>,
}

impl AggregatorOps for ReentrantOwner {
    fn bind(&self, _units: &[MatchedUnit]) -> Result<(), BindError> {
        let registry = self
            .registry
            .lock()
            .clone()
            .ok_or_else(|| BindError::new("registry handle missing"))?;
        let unit = registry
            .register(NodeHandle(500), Arc::new(CountingUnit::default()))
            .map_err(|err| BindError::new(err.to_string()))?;
        *self.spawned.lock() = Some(unit);
        Ok(())
    }

    fn unbind(&self) {}
}

#[test]
fn test_bind_callback_may_reenter_registry() {
    let registry = Arc::new(ComponentRegistry::new());
    let owner = Arc::new(ReentrantOwner {
        registry: parking_lot::Mutex::new(Some(Arc::clone(&registry))),
        spawned: parking_lot::Mutex::new(None),
    });

    let agg = registry
        .begin_matching(identity_set(&[9]), owner.clone())
        .expect("declare aggregator");
    let unit = registry
        .register(NodeHandle(9), Arc::new(CountingUnit::default()))
        .expect("register trigger unit");

    assert_eq!(registry.aggregator_state(agg), Ok(AggregatorState::Bound));
    assert!(registry.is_registered(NodeHandle(500)));

    let spawned = owner.spawned.lock().take().expect("reentrant unit handle");
    // Drop the registry handle held by the owner so the registry can be
    // torn down cleanly at the end of the test.
    owner.registry.lock().take();

    registry.deregister(unit).expect("deregister trigger");
    registry.deregister(spawned).expect("deregister reentrant unit");
    registry.teardown(agg).expect("teardown");
}
