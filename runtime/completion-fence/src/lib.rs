//! Completion Fence - signal-once completion primitive
//!
//! # Purpose
//! A fence represents the eventual, at-most-once completion of an
//! asynchronous operation. The producer side creates and signals it; any
//! number of consumers hold references, wait with a timeout, or register
//! one-shot callbacks that run at the signal transition.
//!
//! # Integration Points
//! - Depends on: nothing below std
//! - Provides to: producers of asynchronous work and their waiters
//! - Callbacks: one-shot completion callbacks and a release callback,
//!   always dispatched outside the fence lock
//!
//! # Architecture
//! - Each fence owns its own lock and condition variable, so contention on
//!   one fence never blocks unrelated fences
//! - State only moves forward: unsignaled, then signaled or error-signaled
//! - The reference count rides on `Arc`; the release callback runs exactly
//!   once when the last handle drops
//!
//! # Testing Strategy
//! - Unit tests: signal idempotence, callback dispatch, timeout polling
//! - Integration tests: multi-waiter timing, signal races, acquire/release
//!   stress across threads

mod fence;

pub use fence::{Fence, SignalOutcome, WaitStatus};

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Fence error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("fence wait timed out")]
    TimedOut,

    #[error("fence signaled with error code {0}")]
    ErrorSignaled(i32),
}

pub type Result<T> = core::result::Result<T, FenceError>;

/// Allocate a fresh fence context id.
///
/// Context ids are process-wide and monotonically increasing; a producer
/// that owns a timeline of fences allocates one context and numbers its
/// fences with increasing sequence numbers.
pub fn context_alloc() -> u64 {
    static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
    NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_alloc_is_monotonic() {
        let a = context_alloc();
        let b = context_alloc();
        assert!(b > a);
    }
}
