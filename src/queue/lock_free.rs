//! Unbounded Michael-Scott queue with hazard pointers and node recycling.
//!
//! The list always holds a dummy head whose item is not live. Dequeue hands the old
//! dummy to the dequeued item, which keeps it until it is enqueued again or released.
//! Reuse goes through [`HazardSlots::reclaim`], so a node is never rewritten while
//! another core may still be reading it.
//!
//! Every operation takes the caller's `slot`, the index of its hazard record. Workers
//! use their core index; at most one thread may use a given slot at a time.

use super::hazard::HazardSlots;
use super::{Item, ItemRef};
use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub(crate) struct Node<T> {
    next: AtomicPtr<Node<T>>,
    item: AtomicPtr<Item<T>>,
}

impl<T> Node<T> {
    fn empty() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            item: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Lock-free multi-producer, multi-consumer FIFO queue of [`ItemRef`]s.
pub struct LockFreeQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    /// Raised before a node is linked and lowered after it is unlinked, so it never
    /// under-counts.
    len: AtomicUsize,
    hazards: HazardSlots<Node<T>>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue with hazard records for `core_count` slots.
    pub fn new(core_count: usize) -> Self {
        let dummy = Node::empty();
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            len: AtomicUsize::new(0),
            hazards: HazardSlots::new(core_count),
        }
    }

    /// Number of hazard slots, i.e. the valid range of `slot` arguments.
    pub fn slot_count(&self) -> usize {
        self.hazards.core_count()
    }

    /// Appends `item` at the tail. Never fails.
    pub fn enqueue(&self, slot: usize, item: ItemRef<T>) {
        let previous = item.item().node.swap(ptr::null_mut(), Ordering::Relaxed);
        let node = match self.hazards.reclaim(previous) {
            recycled if recycled.is_null() => Node::empty(),
            recycled => recycled,
        };

        // SAFETY: `node` is either fresh or reclaimed, so no other thread references it.
        unsafe {
            (*node).item.store(item.into_raw(), Ordering::Relaxed);
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        self.len.fetch_add(1, Ordering::Relaxed);

        let guard = self.hazards.guard(slot);
        let tail = loop {
            let tail = guard.protect(0, &self.tail);
            // SAFETY: `tail` is hazard-protected and was validated as the shared tail.
            let next = unsafe { (*tail).next.load(Ordering::SeqCst) };
            if !next.is_null() {
                // Tail is lagging: help it forward and retry.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Relaxed);
                continue;
            }
            // SAFETY: as above.
            let linked = unsafe {
                (*tail)
                    .next
                    .compare_exchange(ptr::null_mut(), node, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            };
            if linked {
                break tail;
            }
        };
        // Best effort: a lagging tail is fixed by the next enqueue or dequeue.
        let _ = self
            .tail
            .compare_exchange(tail, node, Ordering::SeqCst, Ordering::Relaxed);
    }

    /// Removes the front item, or returns `None` if the queue was observed empty.
    pub fn dequeue(&self, slot: usize) -> Option<ItemRef<T>> {
        let guard = self.hazards.guard(slot);
        let (head, item) = loop {
            let head = guard.protect(0, &self.head);
            // SAFETY: `head` is hazard-protected and validated.
            let next = unsafe { guard.protect(1, &(*head).next) };
            if self.head.load(Ordering::SeqCst) != head {
                // `next` may already be unlinked; its hazard proves nothing.
                continue;
            }
            if next.is_null() {
                return None;
            }
            let tail = self.tail.load(Ordering::SeqCst);
            if tail == head {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Relaxed);
            }
            // Read before the CAS: once head moves, `next` becomes the dummy.
            // SAFETY: `next` is protected and was linked after `head` when validated.
            let item = unsafe { (*next).item.load(Ordering::Acquire) };
            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break (head, item);
            }
        };
        drop(guard);
        self.len.fetch_sub(1, Ordering::Relaxed);

        // SAFETY: the successful CAS made us the only dequeuer of this item.
        let item = unsafe { ItemRef::from_raw(item) };
        item.item().node.store(head, Ordering::Relaxed);
        Some(item)
    }

    /// Retires an item that will not be enqueued again and returns its payload.
    ///
    /// Its backing node is freed when no core holds it as a hazard; otherwise it is
    /// parked in a hazard pool for later reuse.
    pub fn release(&self, item: ItemRef<T>) -> T {
        let node = item.item().node.swap(ptr::null_mut(), Ordering::Relaxed);
        let free = self.hazards.reclaim(node);
        if !free.is_null() {
            // SAFETY: `reclaim` only returns nodes that are unlinked and unhazarded.
            drop(unsafe { Box::from_raw(free) });
        }
        item.into_inner()
    }

    /// Exact when no operation is in flight; a hint otherwise.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queue is unbounded.
    pub fn is_full(&self) -> bool {
        false
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn hazards(&self) -> &HazardSlots<Node<T>> {
        &self.hazards
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        let mut is_dummy = true;
        while !node.is_null() {
            // SAFETY: `&mut self` excludes every other user; list nodes are Box allocations.
            let mut boxed = unsafe { Box::from_raw(node) };
            let item = *boxed.item.get_mut();
            if !is_dummy && !item.is_null() {
                // SAFETY: items still linked are owned by the queue and own no node.
                drop(unsafe { ItemRef::from_raw(item) }.into_inner());
            }
            node = *boxed.next.get_mut();
            is_dummy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_queue_is_empty() {
        let queue = LockFreeQueue::<u32>::new(1);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert!(queue.dequeue(0).is_none());
    }

    #[test]
    fn test_fifo_order_single_thread() {
        let queue = LockFreeQueue::new(1);
        for value in 0..5u32 {
            queue.enqueue(0, Item::new(value));
        }
        assert_eq!(queue.len(), 5);
        for expected in 0..5u32 {
            let item = queue.dequeue(0).expect("queue should not be empty");
            assert_eq!(*item.data(), expected);
            assert_eq!(queue.release(item), expected);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_is_empty_tracks_enqueue_and_dequeue() {
        let queue = LockFreeQueue::new(2);
        queue.enqueue(1, Item::new("a"));
        assert!(!queue.is_empty());
        let item = queue.dequeue(0).unwrap();
        assert!(queue.is_empty());
        queue.enqueue(0, item);
        assert!(!queue.is_empty());
        let item = queue.dequeue(1).unwrap();
        assert!(queue.is_empty());
        queue.release(item);
    }

    #[test]
    fn test_dequeued_item_carries_old_head() {
        let queue = LockFreeQueue::new(1);
        let head_before = queue.head.load(Ordering::SeqCst);
        queue.enqueue(0, Item::new(1u8));
        let item = queue.dequeue(0).unwrap();
        assert!(item.has_node());
        assert_eq!(item.item().node.load(Ordering::Relaxed), head_before);
        queue.release(item);
    }

    #[test]
    fn test_reenqueue_reuses_node_without_stale_links() {
        let queue = LockFreeQueue::new(1);
        queue.enqueue(0, Item::new(10u32));
        queue.enqueue(0, Item::new(20u32));

        let first = queue.dequeue(0).unwrap();
        let recycled = first.item().node.load(Ordering::Relaxed);
        queue.enqueue(0, first);

        // The recycled node is now the tail: no stale successor, and it carries the
        // re-enqueued item rather than whatever it held as a dummy.
        assert_eq!(queue.tail.load(Ordering::SeqCst), recycled);
        unsafe {
            assert!((*recycled).next.load(Ordering::SeqCst).is_null());
            assert_eq!((*(*recycled).item.load(Ordering::SeqCst)).data, 10);
        }

        let order: Vec<u32> = std::iter::from_fn(|| queue.dequeue(0))
            .map(|item| queue.release(item))
            .collect();
        assert_eq!(order, vec![20, 10]);
    }

    #[test]
    fn test_release_parks_hazarded_node() {
        let queue = LockFreeQueue::new(2);
        queue.enqueue(0, Item::new(5u32));
        let item = queue.dequeue(0).unwrap();
        let node = item.item().node.load(Ordering::Relaxed);

        let guard = queue.hazards().guard(1);
        guard.set(0, node);
        assert_eq!(queue.release(item), 5);
        assert_eq!(queue.hazards().pooled_count(), 1);
        drop(guard);
    }

    #[test]
    fn test_drop_frees_remaining_items() {
        use std::sync::Arc;
        let marker = Arc::new(());
        {
            let queue = LockFreeQueue::new(1);
            for _ in 0..3 {
                queue.enqueue(0, Item::new(marker.clone()));
            }
            let item = queue.dequeue(0).unwrap();
            drop(queue.release(item));
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
