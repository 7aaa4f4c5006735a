//! Fiber-aware synchronization primitives.
//!
//! [`FiberLock`] and [`Fence`] block by parking: a fiber that has to wait puts its ready
//! item on the primitive's wait list and switches away, and whoever releases the
//! primitive puts that item back on the global ready queue. Plain OS threads (typically
//! the thread that launched the work) can use the same primitives; they block with
//! `std::thread::park` instead.

pub mod fence;
pub mod lock;
pub(crate) mod spin;

pub use fence::Fence;
pub use lock::{FiberLock, FiberLockGuard};

use crate::fiber::{Fiber, FiberHandle, FiberId, Suspend};
use crate::queue::ItemRef;
use crate::scheduler::Shared;
use crate::worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread, ThreadId};

/// Identity of whoever holds a lock. Fibers keep their identity across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
    Fiber(FiberId),
    Thread(ThreadId),
}

impl Owner {
    pub(crate) fn current() -> Owner {
        match Fiber::current() {
            // SAFETY: the running fiber is alive.
            Some(handle) => Owner::Fiber(unsafe { handle.as_ref() }.id()),
            None => Owner::Thread(thread::current().id()),
        }
    }
}

/// A blocked caller, as stored on a wait list.
pub(crate) enum Waiter {
    Fiber {
        runtime: Arc<Shared>,
        item: ItemRef<FiberHandle>,
    },
    Thread {
        thread: Thread,
        woken: Arc<AtomicBool>,
    },
}

impl Waiter {
    /// Makes the waiter runnable again. Must be called after the wait-list guard is
    /// dropped.
    pub(crate) fn wake(self) {
        match self {
            Waiter::Fiber { runtime, item } => runtime.make_ready(item),
            Waiter::Thread { thread, woken } => {
                woken.store(true, Ordering::Release);
                thread.unpark();
            }
        }
    }
}

/// Blocks the caller until its waiter is woken.
///
/// `register` must put the waiter on a wait list and drop that list's guard. A fiber is
/// findable from the moment `register` returns; it suspends right after, and a waker
/// that picks it up before the switch finishes waits for it (see [`Fiber::claim`]).
pub(crate) fn park_current<F>(register: F)
where
    F: FnOnce(Waiter),
{
    if let Some(handle) = Fiber::current() {
        let Some(runtime) = worker::current_shared() else {
            panic!("fiber is not running on a fiber system worker");
        };
        // SAFETY: the running fiber is alive.
        let Some(item) = unsafe { handle.as_ref() }.take_item() else {
            panic!("running fiber has no ready item");
        };
        #[cfg(feature = "metrics")]
        runtime.record(|m| &m.parks);
        register(Waiter::Fiber { runtime, item });
        worker::suspend_current(Suspend::Park);
        return;
    }

    let woken = Arc::new(AtomicBool::new(false));
    register(Waiter::Thread {
        thread: thread::current(),
        woken: woken.clone(),
    });
    while !woken.load(Ordering::Acquire) {
        thread::park();
    }
}
