//! Fiber primitive: a stackful execution context built on `corosensei`.
//!
//! Coroutines are asymmetric: a fiber can only suspend back to whoever resumed it. Each
//! worker's dispatch loop is that resumer, so "switch from A to B" means A suspends to
//! the dispatcher, which resumes B. Everything above this module (picking, deferred
//! deletion, parking) is scheduler policy. This module only creates, resumes, suspends
//! and deletes contexts.

use crate::error::{Result, SchedulerError};
use crate::queue::ItemRef;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use crossbeam::utils::Backoff;
use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// Pointer to a heap-allocated [`Fiber`]; copied freely, owned by exactly one ready item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(NonNull<Fiber>);

unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    /// # Safety
    /// The fiber must not have been deleted.
    pub unsafe fn as_ref<'a>(self) -> &'a Fiber {
        // SAFETY: guaranteed by the caller.
        unsafe { self.0.as_ref() }
    }

    pub fn as_ptr(self) -> *mut Fiber {
        self.0.as_ptr()
    }
}

/// Process-unique fiber identity, stable across migrations between workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Why a fiber gave up its core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suspend {
    /// Still runnable; the dispatcher re-enqueues it.
    Yield,
    /// Parked on a wait list; whoever wakes it re-enqueues it.
    Park,
}

/// Outcome of resuming a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    Suspended(Suspend),
    Finished,
}

type FiberCoroutine = Coroutine<FiberHandle, Suspend, (), DefaultStack>;

/// A cooperatively scheduled context with its own stack.
pub struct Fiber {
    coroutine: UnsafeCell<FiberCoroutine>,
    /// Valid while the coroutine has started and not finished.
    yielder: Cell<*const Yielder<FiberHandle, Suspend>>,
    /// Set once the fiber has fully switched out. A new host must clear it before
    /// resuming, so a fiber that published itself before suspending never runs twice.
    suspended: AtomicBool,
    /// Fiber-local storage: the ready item that represents this fiber while it runs.
    item: AtomicPtr<crate::queue::Item<FiberHandle>>,
    id: FiberId,
}

unsafe impl Send for Fiber {}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
}

impl Fiber {
    /// Allocates a fiber with a `stack_size`-byte stack that runs `entry` when first resumed.
    pub fn spawn<F>(stack_size: usize, entry: F) -> Result<FiberHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|source| SchedulerError::FiberStack {
            size: stack_size,
            source,
        })?;

        let coroutine = Coroutine::with_stack(
            stack,
            move |yielder: &Yielder<FiberHandle, Suspend>, this: FiberHandle| {
                // SAFETY: the dispatcher passes the fiber being resumed, which is alive.
                unsafe { this.as_ref() }.yielder.set(yielder as *const _);
                entry();
            },
        );

        let fiber = Box::new(Fiber {
            coroutine: UnsafeCell::new(coroutine),
            yielder: Cell::new(ptr::null()),
            suspended: AtomicBool::new(true),
            item: AtomicPtr::new(ptr::null_mut()),
            id: FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
        });
        Ok(FiberHandle(NonNull::from(Box::leak(fiber))))
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    fn handle(&self) -> FiberHandle {
        FiberHandle(NonNull::from(self))
    }

    /// Waits until the previous host has switched out, then takes the right to run.
    pub fn claim(&self) {
        let backoff = Backoff::new();
        while self
            .suspended
            .compare_exchange_weak(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    /// Called by the host once `resume` returned with the fiber suspended.
    pub fn mark_suspended(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Runs the fiber until it suspends or finishes.
    ///
    /// # Safety
    /// The caller must hold the run right from [`claim`](Self::claim) and the fiber must
    /// not be finished.
    pub unsafe fn resume(&self) -> FiberState {
        let handle = self.handle();
        let outer = CURRENT_FIBER.replace(Some(handle));
        // SAFETY: the run right makes this the only access to the coroutine.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        let result = coroutine.resume(handle);
        CURRENT_FIBER.set(outer);

        match result {
            CoroutineResult::Yield(reason) => FiberState::Suspended(reason),
            CoroutineResult::Return(()) => FiberState::Finished,
        }
    }

    /// Suspends the running fiber back to its host.
    ///
    /// Panics when called outside a fiber.
    pub fn suspend(reason: Suspend) {
        let Some(handle) = Fiber::current() else {
            panic!("Fiber::suspend called outside of a fiber");
        };
        // SAFETY: the running fiber is alive.
        let yielder = unsafe { handle.as_ref() }.yielder.get();
        if yielder.is_null() {
            panic!("fiber suspended before its yielder was initialized");
        }
        // SAFETY: the yielder lives on the coroutine stack until the coroutine returns.
        unsafe { (*yielder).suspend(reason) };
    }

    /// The fiber running on this thread, if any.
    #[inline(never)]
    pub fn current() -> Option<FiberHandle> {
        CURRENT_FIBER.get()
    }

    pub(crate) fn set_item(&self, item: ItemRef<FiberHandle>) {
        let old = self.item.swap(item.into_raw(), Ordering::Relaxed);
        debug_assert!(old.is_null(), "fiber already holds its ready item");
    }

    pub(crate) fn take_item(&self) -> Option<ItemRef<FiberHandle>> {
        let raw = self.item.swap(ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: the slot held the unique handle stored by `set_item`.
        (!raw.is_null()).then(|| unsafe { ItemRef::from_raw(raw) })
    }

    /// Whether the coroutine ran to completion.
    ///
    /// # Safety
    /// Same contract as [`resume`](Self::resume): no other thread may be running it.
    pub unsafe fn is_finished(&self) -> bool {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.coroutine.get()).done() }
    }

    /// # Safety
    /// Same contract as [`is_finished`](Self::is_finished).
    pub unsafe fn is_started(&self) -> bool {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.coroutine.get()).started() }
    }

    /// Frees a fiber and its stack.
    ///
    /// # Safety
    /// The fiber must be finished or never started, must not be the running fiber, and
    /// `handle` must not be used afterwards.
    pub unsafe fn delete(handle: FiberHandle) {
        debug_assert_ne!(Fiber::current(), Some(handle), "fiber deleting itself");
        // SAFETY: guaranteed by the caller; the handle came from `Box::leak` in `spawn`.
        let fiber = unsafe { Box::from_raw(handle.as_ptr()) };
        debug_assert!(
            unsafe { fiber.is_finished() || !fiber.is_started() },
            "deleting a suspended fiber"
        );
        drop(fiber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    const STACK: usize = 64 * 1024;

    #[test]
    fn test_fiber_runs_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let handle = Fiber::spawn(STACK, move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let fiber = unsafe { handle.as_ref() };
        fiber.claim();
        assert_eq!(unsafe { fiber.resume() }, FiberState::Finished);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        unsafe { Fiber::delete(handle) };
    }

    #[test]
    fn test_suspend_and_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps_clone = steps.clone();
        let handle = Fiber::spawn(STACK, move || {
            steps_clone.fetch_add(1, Ordering::SeqCst);
            Fiber::suspend(Suspend::Yield);
            steps_clone.fetch_add(1, Ordering::SeqCst);
            Fiber::suspend(Suspend::Park);
            steps_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let fiber = unsafe { handle.as_ref() };

        fiber.claim();
        assert_eq!(unsafe { fiber.resume() }, FiberState::Suspended(Suspend::Yield));
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        fiber.mark_suspended();

        fiber.claim();
        assert_eq!(unsafe { fiber.resume() }, FiberState::Suspended(Suspend::Park));
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        fiber.mark_suspended();

        fiber.claim();
        assert_eq!(unsafe { fiber.resume() }, FiberState::Finished);
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert!(unsafe { fiber.is_finished() });
        unsafe { Fiber::delete(handle) };
    }

    #[test]
    fn test_current_is_set_only_inside_fiber() {
        assert!(Fiber::current().is_none());
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        let handle = Fiber::spawn(STACK, move || {
            seen_clone.store(Fiber::current().is_some(), Ordering::SeqCst);
        })
        .unwrap();
        let fiber = unsafe { handle.as_ref() };
        fiber.claim();
        unsafe { fiber.resume() };
        assert!(seen.load(Ordering::SeqCst));
        assert!(Fiber::current().is_none());
        unsafe { Fiber::delete(handle) };
    }

    #[test]
    fn test_fiber_ids_are_unique() {
        let a = Fiber::spawn(STACK, || {}).unwrap();
        let b = Fiber::spawn(STACK, || {}).unwrap();
        unsafe {
            assert_ne!(a.as_ref().id(), b.as_ref().id());
            Fiber::delete(a);
            Fiber::delete(b);
        }
    }

    #[test]
    fn test_item_slot_round_trip() {
        let handle = Fiber::spawn(STACK, || {}).unwrap();
        let fiber = unsafe { handle.as_ref() };
        assert!(fiber.take_item().is_none());
        fiber.set_item(crate::queue::Item::new(handle));
        let item = fiber.take_item().expect("item was stored");
        assert_eq!(*item.data(), handle);
        assert_eq!(item.into_inner(), handle);
        unsafe { Fiber::delete(handle) };
    }

    #[test]
    #[should_panic(expected = "outside of a fiber")]
    fn test_suspend_outside_fiber_panics() {
        Fiber::suspend(Suspend::Yield);
    }
}
