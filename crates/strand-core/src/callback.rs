//! One-shot completion callbacks.
//!
//! A `Callback` is a continuation with exactly two terminal transitions,
//! `succeeded` and `failed(cause)`, either of which consumes it. The
//! at-most-once contract is therefore enforced by the type system: a
//! completed callback no longer exists. Completion may be synchronous
//! (invoked on the caller's stack before the initiating call returns) or
//! asynchronous from another thread.
//!
//! `Latch` is the blocking companion: it mints a callback whose
//! completion unparks a waiting thread. The blocking adaptors and tests
//! are its only intended users; one parked OS thread per operation is
//! the documented cost.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Result, StrandError};

/// A one-shot completion continuation.
pub struct Callback {
    on_done: Box<dyn FnOnce(Result<()>) + Send>,
}

impl Callback {
    /// Wrap a closure receiving the terminal result.
    pub fn new(f: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self { on_done: Box::new(f) }
    }

    /// A callback that ignores its completion. For fire-and-forget
    /// writes where failure is already observable elsewhere.
    pub fn noop() -> Self {
        Self::new(|_| ())
    }

    /// Terminal success transition.
    #[inline]
    pub fn succeeded(self) {
        (self.on_done)(Ok(()));
    }

    /// Terminal failure transition.
    #[inline]
    pub fn failed(self, cause: StrandError) {
        (self.on_done)(Err(cause));
    }

    /// Complete from a `Result`.
    #[inline]
    pub fn complete(self, result: Result<()>) {
        (self.on_done)(result);
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

/// Converts callback completion into a thread block.
///
/// One `Latch` serves one operation: mint a callback with
/// [`Latch::callback`], hand it to the async operation, then
/// [`Latch::wait`]. The latch is a cheap cloneable handle.
#[derive(Clone)]
pub struct Latch {
    inner: std::sync::Arc<LatchInner>,
}

struct LatchInner {
    state: Mutex<Option<Result<()>>>,
    signal: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(LatchInner {
                state: Mutex::new(None),
                signal: Condvar::new(),
            }),
        }
    }

    /// A callback that stores its result and wakes the waiter.
    pub fn callback(&self) -> Callback {
        let latch = self.inner.clone();
        Callback::new(move |result| {
            let mut state = latch.state.lock().unwrap();
            *state = Some(result);
            latch.signal.notify_all();
        })
    }

    /// Block until the callback completes. `None` timeout blocks forever;
    /// an elapsed timeout reports `StrandError::Timeout`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            match timeout {
                None => state = self.inner.signal.wait(state).unwrap(),
                Some(limit) => {
                    let (guard, wait) = self.inner.signal.wait_timeout(state, limit).unwrap();
                    state = guard;
                    if wait.timed_out() && state.is_none() {
                        return Err(StrandError::Timeout);
                    }
                }
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
