//! Countdown fence: completion tracking for groups of tasks.

use super::{Waiter, park_current};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

struct FenceInner {
    count: AtomicUsize,
    waiters: Mutex<Vec<Waiter>>,
}

/// A countdown latch. Each [`signal`](Fence::signal) lowers the count by one; the
/// signal that reaches zero wakes every waiter.
///
/// Cloning shares the same fence, so a clone can be handed to each task.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Creates a fence that opens after `count` signals.
    pub fn new(count: usize) -> Self {
        Fence {
            inner: Arc::new(FenceInner {
                count: AtomicUsize::new(count),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Decrements the count, waking all waiters when it reaches zero.
    ///
    /// Returns true for the signal that opened the fence. Signals past zero are
    /// ignored and return false.
    pub fn signal(&self) -> bool {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });

        match previous {
            Ok(1) => {
                let waiters = std::mem::take(&mut *self.inner.waiters.lock());
                for waiter in waiters {
                    waiter.wake();
                }
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("fence signalled after reaching zero");
                false
            }
        }
    }

    /// Blocks the caller until the count reaches zero.
    ///
    /// A fiber parks and its worker moves on to other tasks; a plain thread parks the
    /// thread.
    pub fn wait_for_signal(&self) {
        if self.is_signaled() {
            return;
        }
        let mut waiters = self.inner.waiters.lock();
        // Re-check under the list lock: the opening signal drains the list after
        // decrementing, so either it sees us or we see zero.
        if self.is_signaled() {
            return;
        }
        park_current(move |waiter| {
            waiters.push(waiter);
            drop(waiters);
        });
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_signaled(&self) -> bool {
        self.count() == 0
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence").field("count", &self.count()).finish()
    }
}
