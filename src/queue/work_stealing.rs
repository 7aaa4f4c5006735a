//! Chase-Lev work-stealing deque over a fixed circular array.
//!
//! The owner pushes and pops at the bottom (LIFO); thieves steal from the top (FIFO)
//! by CAS on `top`. The array never grows, so a full deque rejects pushes.
//!
//! The scheduler does not use this yet. It is the intended building block for
//! stealing between workers' local queues.

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering, fence};

struct Inner<T, const N: usize> {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send, const N: usize> Send for Inner<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Inner<T, N> {}

impl<T, const N: usize> Inner<T, N> {
    fn slot(&self, index: isize) -> *mut MaybeUninit<T> {
        self.slots[index.rem_euclid(N as isize) as usize].get()
    }

    fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Acquire);
        let top = self.top.load(Ordering::Acquire);
        (bottom - top).max(0) as usize
    }
}

impl<T, const N: usize> Drop for Inner<T, N> {
    fn drop(&mut self) {
        let top = *self.top.get_mut();
        let bottom = *self.bottom.get_mut();
        for index in top..bottom {
            // SAFETY: slots in [top, bottom) hold initialized, unclaimed values.
            unsafe { (*self.slot(index)).assume_init_drop() };
        }
    }
}

/// Owner end of the deque. `Send` but not `Sync`: exactly one thread pushes and pops.
pub struct WorkStealingQueue<T, const N: usize> {
    inner: Arc<Inner<T, N>>,
    _not_sync: PhantomData<*mut ()>,
}

unsafe impl<T: Send, const N: usize> Send for WorkStealingQueue<T, N> {}

/// Thief end of the deque. Any number of threads may steal concurrently.
pub struct Stealer<T, const N: usize> {
    inner: Arc<Inner<T, N>>,
}

impl<T, const N: usize> Clone for Stealer<T, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, const N: usize> Default for WorkStealingQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> WorkStealingQueue<T, N> {
    pub fn new() -> Self {
        assert!(N > 0, "work-stealing queue needs at least one slot");
        let slots = (0..N)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                top: CachePadded::new(AtomicIsize::new(0)),
                bottom: CachePadded::new(AtomicIsize::new(0)),
                slots,
            }),
            _not_sync: PhantomData,
        }
    }

    pub fn stealer(&self) -> Stealer<T, N> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Pushes at the bottom, handing the item back when the deque is full.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        let top = inner.top.load(Ordering::Acquire);
        if bottom - top >= N as isize {
            return Err(item);
        }
        // SAFETY: only the owner writes slots, and `bottom` is outside [top, bottom).
        unsafe { (*inner.slot(bottom)).write(item) };
        fence(Ordering::Release);
        inner.bottom.store(bottom + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Pops the most recently pushed item.
    pub fn dequeue(&self) -> Option<T> {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed) - 1;
        inner.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = inner.top.load(Ordering::Relaxed);

        if top > bottom {
            // Empty: undo the speculative decrement.
            inner.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: the slot is initialized; ownership is only assumed once we win it.
        let item = unsafe { inner.slot(bottom).read() };
        if top < bottom {
            // More than one element left, no thief can reach this slot.
            return Some(unsafe { item.assume_init() });
        }

        // Last element: race thieves for it through `top`.
        let won = inner
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.bottom.store(bottom + 1, Ordering::Relaxed);
        // SAFETY: winning the CAS transfers ownership; losing means a thief owns it.
        won.then(|| unsafe { item.assume_init() })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Stealer<T, N> {
    /// Takes the oldest item, retrying while other thieves or the owner win races.
    pub fn steal(&self) -> Option<T> {
        let inner = &*self.inner;
        let backoff = Backoff::new();
        loop {
            let top = inner.top.load(Ordering::Acquire);
            fence(Ordering::SeqCst);
            let bottom = inner.bottom.load(Ordering::Acquire);
            if top >= bottom {
                return None;
            }
            // Read before the CAS: after it the owner may reuse the slot. If the owner
            // wraps around and overwrites this slot concurrently, the read may be torn;
            // the CAS below then fails and the value is discarded without being used.
            // The read is volatile so the compiler cannot assume it is race-free.
            // SAFETY: the slot was published by the owner's release fence.
            let item = unsafe { ptr::read_volatile(inner.slot(top)) };
            if inner
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: the CAS made this thief the unique owner of the value.
                return Some(unsafe { item.assume_init() });
            }
            backoff.spin();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 20;

    #[test]
    fn test_new_queue_is_empty() {
        let queue = WorkStealingQueue::<u32, SIZE>::new();
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.stealer().steal(), None);
    }

    #[test]
    fn test_full_queue_rejects_items() {
        let queue = WorkStealingQueue::<usize, SIZE>::new();
        for i in 0..SIZE {
            assert!(queue.enqueue(i).is_ok());
        }
        assert!(queue.is_full());
        assert_eq!(queue.enqueue(99), Err(99));
    }

    #[test]
    fn test_owner_pops_lifo() {
        let queue = WorkStealingQueue::<u32, SIZE>::new();
        for i in 1..=3 {
            queue.enqueue(i).unwrap();
        }
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_thief_steals_fifo() {
        let queue = WorkStealingQueue::<u32, SIZE>::new();
        let stealer = queue.stealer();
        for i in 1..=3 {
            queue.enqueue(i).unwrap();
        }
        assert_eq!(stealer.steal(), Some(1));
        assert_eq!(stealer.steal(), Some(2));
        assert_eq!(stealer.steal(), Some(3));
        assert_eq!(stealer.steal(), None);
    }

    #[test]
    fn test_wraps_around_the_ring() {
        let queue = WorkStealingQueue::<usize, 4>::new();
        let stealer = queue.stealer();
        for round in 0..10 {
            for i in 0..4 {
                queue.enqueue(round * 4 + i).unwrap();
            }
            assert_eq!(stealer.steal(), Some(round * 4));
            assert_eq!(queue.dequeue(), Some(round * 4 + 3));
            assert_eq!(stealer.steal(), Some(round * 4 + 1));
            assert_eq!(queue.dequeue(), Some(round * 4 + 2));
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_thieves_racing_a_wrapping_owner_take_each_item_once() {
        use std::sync::atomic::{AtomicBool, AtomicUsize};
        use std::thread;

        // A tiny ring makes the owner overwrite slots that thieves are still reading.
        // Boxed items turn a stolen-twice value into a double free.
        const ITEMS: usize = 20_000;
        let queue = WorkStealingQueue::<Box<usize>, 4>::new();
        let done = Arc::new(AtomicBool::new(false));
        let stolen = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let (stealer, done, stolen) = (queue.stealer(), done.clone(), stolen.clone());
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while !done.load(Ordering::Acquire) || !stealer.is_empty() {
                        if let Some(item) = stealer.steal() {
                            taken.push(*item);
                            stolen.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    taken
                })
            })
            .collect();

        let mut seen = vec![false; ITEMS];
        let mut next = 0;
        while next < ITEMS {
            match queue.enqueue(Box::new(next)) {
                Ok(()) => next += 1,
                Err(_) => {
                    if let Some(item) = queue.dequeue() {
                        assert!(!std::mem::replace(&mut seen[*item], true));
                    }
                }
            }
        }
        while let Some(item) = queue.dequeue() {
            assert!(!std::mem::replace(&mut seen[*item], true));
        }
        done.store(true, Ordering::Release);

        for thief in thieves {
            for value in thief.join().unwrap() {
                assert!(!std::mem::replace(&mut seen[value], true), "{value} taken twice");
            }
        }
        assert!(seen.iter().all(|&taken| taken));
        assert!(stolen.load(Ordering::Relaxed) <= ITEMS);
    }

    #[test]
    fn test_drop_releases_unclaimed_items() {
        let marker = Arc::new(());
        {
            let queue = WorkStealingQueue::<Arc<()>, 8>::new();
            for _ in 0..5 {
                queue.enqueue(marker.clone()).unwrap();
            }
            drop(queue.dequeue());
            drop(queue.stealer().steal());
            assert_eq!(Arc::strong_count(&marker), 4);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
