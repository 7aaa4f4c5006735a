//! Fiber-aware mutual exclusion.

use super::spin::SpinLock;
use super::{Owner, Waiter, park_current};
use std::collections::VecDeque;

struct LockState {
    locked: bool,
    owner: Option<Owner>,
    /// FIFO; each waiter carries the identity it will own the lock under.
    waiters: VecDeque<(Owner, Waiter)>,
}

/// A mutex that parks contending fibers instead of blocking their worker thread.
///
/// Release hands the lock straight to the oldest waiter, so a woken fiber already owns
/// the lock when it resumes. Not reentrant.
pub struct FiberLock {
    state: SpinLock<LockState>,
}

impl Default for FiberLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberLock {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(LockState {
                locked: false,
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Takes the lock, parking the caller while another owner holds it.
    pub fn acquire(&self) {
        let me = Owner::current();
        let mut state = self.state.lock();
        if !state.locked {
            state.locked = true;
            state.owner = Some(me);
            return;
        }
        debug_assert_ne!(state.owner, Some(me), "FiberLock is not reentrant");

        park_current(move |waiter| {
            state.waiters.push_back((me, waiter));
            drop(state);
        });
    }

    /// Takes the lock only if it is free.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            return false;
        }
        state.locked = true;
        state.owner = Some(Owner::current());
        true
    }

    /// Releases the lock, handing it to the oldest waiter if there is one.
    ///
    /// # Panics
    /// If the caller does not own the lock.
    pub fn release(&self) {
        let me = Owner::current();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            let owner = state.owner;
            drop(state);
            panic!("FiberLock released by {me:?}, which does not own it (owner: {owner:?})");
        }

        let next = state.waiters.pop_front();
        match &next {
            Some((owner, _)) => state.owner = Some(*owner),
            None => {
                state.locked = false;
                state.owner = None;
            }
        }
        drop(state);

        if let Some((_, waiter)) = next {
            waiter.wake();
        }
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    pub fn lock(&self) -> FiberLockGuard<'_> {
        self.acquire();
        FiberLockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of callers parked on the lock.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Releases the [`FiberLock`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FiberLockGuard<'a> {
    lock: &'a FiberLock,
}

impl Drop for FiberLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
