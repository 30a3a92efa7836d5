//! The fence object: state, waiters, and one-shot callbacks.
//!
//! Signal and callback dispatch happen after the fence lock is released,
//! so a callback may touch the fence again, including releasing its own
//! reference.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::FenceError;

/// Terminal outcome observed by waiters and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The fence completed successfully.
    Signaled,
    /// The fence completed with an errno-style failure code.
    ErrorSignaled(i32),
    /// The wait deadline elapsed before the fence became terminal.
    TimedOut,
}

impl WaitStatus {
    /// Bridge to `?`-style handling for callers that treat anything but a
    /// clean signal as an error.
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::ErrorSignaled(code) => Err(FenceError::ErrorSignaled(code)),
            WaitStatus::TimedOut => Err(FenceError::TimedOut),
        }
    }
}

/// Result of a signal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// This call performed the one terminal transition.
    Signaled,
    /// The fence was already terminal; nothing changed.
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Signaled,
    Error(i32),
}

impl Terminal {
    fn status(self) -> WaitStatus {
        match self {
            Terminal::Signaled => WaitStatus::Signaled,
            Terminal::Error(code) => WaitStatus::ErrorSignaled(code),
        }
    }
}

type FenceCallback = Box<dyn FnOnce(WaitStatus) + Send>;
type ReleaseCallback = Box<dyn FnOnce() + Send>;

struct Shared {
    state: Option<Terminal>,
    callbacks: Vec<FenceCallback>,
}

struct FenceCore {
    context: u64,
    seqno: u64,
    shared: Mutex<Shared>,
    signaled: Condvar,
    // Behind a lock only so the core stays Sync; taken once, in drop.
    release: Mutex<Option<ReleaseCallback>>,
}

impl Drop for FenceCore {
    fn drop(&mut self) {
        if self.shared.get_mut().state.is_none() {
            // Contract violation: the producing side must signal (with the
            // error flag if the operation failed) before dropping its last
            // reference, or waiters could have blocked forever.
            error!(
                "fence {}:{} dropped while unsignaled",
                self.context, self.seqno
            );
            debug_assert!(false, "fence dropped while unsignaled");
        }
        if let Some(release) = self.release.get_mut().take() {
            release();
        }
    }
}

/// Reference-counted, signal-once completion fence.
///
/// Cloning a handle acquires another reference; dropping one releases it.
/// The release callback runs exactly once when the last handle drops, even
/// under concurrent releases from different threads.
pub struct Fence {
    core: Arc<FenceCore>,
}

impl Fence {
    /// Create an unsignaled fence with one reference.
    pub fn new(context: u64, seqno: u64) -> Self {
        Self::init(context, seqno, None)
    }

    /// Create an unsignaled fence whose `release` callback runs when the
    /// last reference drops.
    pub fn with_release(context: u64, seqno: u64, release: impl FnOnce() + Send + 'static) -> Self {
        Self::init(context, seqno, Some(Box::new(release)))
    }

    fn init(context: u64, seqno: u64, release: Option<ReleaseCallback>) -> Self {
        Self {
            core: Arc::new(FenceCore {
                context,
                seqno,
                shared: Mutex::new(Shared {
                    state: None,
                    callbacks: Vec::new(),
                }),
                signaled: Condvar::new(),
                release: Mutex::new(release),
            }),
        }
    }

    /// Take another reference to the fence.
    pub fn acquire(&self) -> Fence {
        self.clone()
    }

    /// Drop this reference. The last release invokes the release callback.
    pub fn release(self) {
        drop(self);
    }

    /// Context id the fence was created under.
    pub fn context(&self) -> u64 {
        self.core.context
    }

    /// Sequence number within the context.
    pub fn seqno(&self) -> u64 {
        self.core.seqno
    }

    /// True once the fence is terminal.
    pub fn is_signaled(&self) -> bool {
        self.core.shared.lock().state.is_some()
    }

    /// Failure code, if the fence was error-signaled.
    pub fn error(&self) -> Option<i32> {
        match self.core.shared.lock().state {
            Some(Terminal::Error(code)) => Some(code),
            _ => None,
        }
    }

    /// Mark the fence completed and wake every waiter.
    ///
    /// Idempotent: a call on an already-terminal fence changes nothing and
    /// reports [`SignalOutcome::Late`]. On the transitioning call every
    /// registered callback runs exactly once, outside the fence lock.
    pub fn signal(&self) -> SignalOutcome {
        self.finish(Terminal::Signaled)
    }

    /// Mark the fence completed with a failure code and wake every waiter.
    pub fn signal_error(&self, code: i32) -> SignalOutcome {
        self.finish(Terminal::Error(code))
    }

    fn finish(&self, terminal: Terminal) -> SignalOutcome {
        let callbacks = {
            let mut shared = self.core.shared.lock();
            if shared.state.is_some() {
                debug!(
                    "late signal on fence {}:{}",
                    self.core.context, self.core.seqno
                );
                return SignalOutcome::Late;
            }
            shared.state = Some(terminal);
            self.core.signaled.notify_all();
            std::mem::take(&mut shared.callbacks)
        };
        debug!(
            "fence {}:{} signaled ({:?})",
            self.core.context,
            self.core.seqno,
            terminal.status()
        );
        for callback in callbacks {
            callback(terminal.status());
        }
        SignalOutcome::Signaled
    }

    /// Block until the fence is terminal or `timeout` elapses.
    ///
    /// A zero timeout polls without blocking. Spurious wakeups re-check
    /// the state, and a terminal state always wins over the deadline: a
    /// signal that lands before the waiter returns is never reported as
    /// [`WaitStatus::TimedOut`].
    pub fn wait(&self, timeout: Duration) -> WaitStatus {
        let mut shared = self.core.shared.lock();
        if let Some(terminal) = shared.state {
            return terminal.status();
        }
        if timeout.is_zero() {
            return WaitStatus::TimedOut;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let timed_out = self
                .core
                .signaled
                .wait_until(&mut shared, deadline)
                .timed_out();
            if let Some(terminal) = shared.state {
                return terminal.status();
            }
            if timed_out {
                return WaitStatus::TimedOut;
            }
        }
    }

    /// Register a one-shot callback for the signal transition.
    ///
    /// If the fence is already terminal the callback runs immediately,
    /// before this call returns.
    pub fn add_callback(&self, callback: impl FnOnce(WaitStatus) + Send + 'static) {
        let status = {
            let mut shared = self.core.shared.lock();
            match shared.state {
                None => {
                    shared.callbacks.push(Box::new(callback));
                    return;
                }
                Some(terminal) => terminal.status(),
            }
        };
        callback(status);
    }

    /// Current number of references, for diagnostics.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.core)
    }
}

impl Clone for Fence {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.core.context)
            .field("seqno", &self.core.seqno)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
