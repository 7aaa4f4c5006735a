//! Ready-queue data structures.
//!
//! - [`LockFreeQueue`]: the global MPMC queue every worker polls.
//! - [`LocalQueue`]: the bounded per-worker LIFO fast path.
//! - [`WorkStealingQueue`]: a Chase-Lev deque, not used by the picker.
//!
//! The scheduler moves [`ItemRef`]s between these queues and the wait lists of the
//! synchronization primitives. An item remembers the lock-free node that last backed
//! it, so re-enqueuing a parked fiber usually needs no allocation.

pub mod hazard;
pub mod local;
pub mod lock_free;
pub mod work_stealing;

pub use local::LocalQueue;
pub use lock_free::LockFreeQueue;
pub use work_stealing::{Stealer, WorkStealingQueue};

use lock_free::Node;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// A queue entry: the payload plus the node that currently backs it.
pub struct Item<T> {
    data: T,
    /// Node handed over by the last dequeue. Null for fresh items and while enqueued.
    pub(crate) node: AtomicPtr<Node<T>>,
}

/// Unique owning handle to a heap-allocated [`Item`].
///
/// Exactly one `ItemRef` exists per live item; it moves between queues. There is no
/// `Drop` impl: an item that was ever dequeued from a [`LockFreeQueue`] owns a node that
/// only [`LockFreeQueue::release`] may reclaim, so items are retired explicitly.
#[must_use = "items must be enqueued or released"]
pub struct ItemRef<T>(NonNull<Item<T>>);

unsafe impl<T: Send> Send for ItemRef<T> {}

impl<T> Item<T> {
    /// Allocates a fresh item with no backing node.
    pub fn new(data: T) -> ItemRef<T> {
        let boxed = Box::new(Item {
            data,
            node: AtomicPtr::new(ptr::null_mut()),
        });
        ItemRef(NonNull::from(Box::leak(boxed)))
    }
}

impl<T> ItemRef<T> {
    pub fn data(&self) -> &T {
        // SAFETY: the handle is unique and the allocation lives until `into_inner`.
        unsafe { &self.0.as_ref().data }
    }

    /// Whether a lock-free node is currently parked on this item.
    pub fn has_node(&self) -> bool {
        !self.item().node.load(Ordering::Relaxed).is_null()
    }

    /// Frees an item that owns no node and returns its payload.
    ///
    /// Items that came out of a [`LockFreeQueue`] must go through
    /// [`LockFreeQueue::release`] instead, or their node leaks.
    pub fn into_inner(self) -> T {
        debug_assert!(!self.has_node(), "item still owns a queue node");
        // SAFETY: `self` is the unique handle to a `Box` allocation made in `Item::new`.
        let boxed = unsafe { Box::from_raw(self.0.as_ptr()) };
        boxed.data
    }

    pub(crate) fn item(&self) -> &Item<T> {
        // SAFETY: see `data`.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn into_raw(self) -> *mut Item<T> {
        self.0.as_ptr()
    }

    /// # Safety
    /// `raw` must come from [`ItemRef::into_raw`] and no other handle to it may exist.
    pub(crate) unsafe fn from_raw(raw: *mut Item<T>) -> Self {
        debug_assert!(!raw.is_null());
        // SAFETY: guaranteed non-null by the caller.
        ItemRef(unsafe { NonNull::new_unchecked(raw) })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ItemRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRef")
            .field("data", self.data())
            .field("has_node", &self.has_node())
            .finish()
    }
}
