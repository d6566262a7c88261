//! Advisory lock layer
//!
//! A cooperative counting primitive that lets callers reserve the channel
//! across several commands. Locks do not gate writes; they gate callers that
//! choose to take them. Releases are FIFO: the N-th `unlock` wakes the N-th
//! waiter.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::queue::{completion, Completion, Resolver};

#[derive(Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<Resolver<()>>,
}

/// The lock queue. Logically disjoint from the command queue.
#[derive(Default)]
pub(crate) struct LockLayer {
    inner: Mutex<LockState>,
}

impl LockLayer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire the advisory lock. The returned completion fires immediately
    /// if no lock is outstanding, otherwise when enough `unlock` calls have
    /// drained the waiters ahead of it.
    pub(crate) fn lock(&self) -> Completion<()> {
        let (resolver, comp) = completion();
        let mut state = self.inner.lock().unwrap();
        if state.held {
            state.waiters.push_back(resolver);
        } else {
            state.held = true;
            resolver.resolve(());
        }
        comp
    }

    /// Release one hold on the lock, waking the next waiter if any.
    pub(crate) fn unlock(&self) {
        let mut state = self.inner.lock().unwrap();
        if let Some(waiter) = state.waiters.pop_front() {
            waiter.resolve(());
        } else {
            state.held = false;
        }
    }

    /// Whether any lock is outstanding.
    pub(crate) fn locked(&self) -> bool {
        self.inner.lock().unwrap().held
    }

    /// Release every outstanding lock. Used by `clear()` on teardown.
    pub(crate) fn release_all(&self) {
        let mut state = self.inner.lock().unwrap();
        for waiter in state.waiters.drain(..) {
            waiter.resolve(());
        }
        state.held = false;
    }
}
