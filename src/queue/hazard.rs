//! Per-core hazard pointers with node pooling.
//!
//! Every core owns two hazard slots and two pool slots. Before dereferencing a shared
//! node a core publishes it in one of its hazard slots; before reusing or freeing a node,
//! [`HazardSlots::reclaim`] scans every core's hazards and parks conflicting nodes in the
//! matching pool slot instead of handing them out. There is no epoch or deferred free
//! list: the cost is an O(cores) scan per reclaim.
//!
//! Ordering contract:
//! - publishing a hazard is a `SeqCst` store, and the caller re-validates the source
//!   pointer with a `SeqCst` load before dereferencing;
//! - clearing a hazard is a `Release` store;
//! - the reclaim scan reads hazards with `SeqCst` loads and swaps pool slots with
//!   `AcqRel`.
//!
//! A node must already be unreachable from the shared structure when it is passed to
//! `reclaim`. Any hazard validated before it was unlinked is then visible to the scan,
//! and any hazard published after it was unlinked fails validation.
//!
//! Nodes are assumed to be `Box` allocations: pooled nodes are freed with
//! `Box::from_raw` when the slots are dropped.

use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Number of hazard (and pool) slots per core.
pub const HAZARDS_PER_CORE: usize = 2;

struct CoreData<N> {
    hazards: [AtomicPtr<N>; HAZARDS_PER_CORE],
    pooled: [AtomicPtr<N>; HAZARDS_PER_CORE],
}

impl<N> CoreData<N> {
    fn new() -> Self {
        Self {
            hazards: [const { AtomicPtr::new(ptr::null_mut()) }; HAZARDS_PER_CORE],
            pooled: [const { AtomicPtr::new(ptr::null_mut()) }; HAZARDS_PER_CORE],
        }
    }
}

/// Hazard and pool slots for a fixed number of cores.
pub struct HazardSlots<N> {
    cores: Box<[CachePadded<CoreData<N>>]>,
}

unsafe impl<N: Send> Send for HazardSlots<N> {}
unsafe impl<N: Send> Sync for HazardSlots<N> {}

impl<N> HazardSlots<N> {
    pub fn new(core_count: usize) -> Self {
        let cores = (0..core_count.max(1))
            .map(|_| CachePadded::new(CoreData::new()))
            .collect();
        Self { cores }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Borrows the hazard slots of `core`. Hazards are cleared when the guard drops.
    ///
    /// Only one thread may hold a guard for a given core at a time.
    pub fn guard(&self, core: usize) -> HazardGuard<'_, N> {
        assert!(
            core < self.cores.len(),
            "hazard slot {core} out of range ({} cores)",
            self.cores.len()
        );
        HazardGuard { slots: self, core }
    }

    /// Whether any core currently publishes `node` as a hazard.
    pub fn is_hazard(&self, node: *mut N) -> bool {
        !node.is_null()
            && self.cores.iter().any(|core| {
                core.hazards
                    .iter()
                    .any(|hazard| hazard.load(Ordering::SeqCst) == node)
            })
    }

    /// Returns a node that no core holds as a hazard, starting from `candidate`.
    ///
    /// Whenever the current candidate matches a core's hazard it is exchanged with that
    /// core's pool slot and the scan continues with whatever the pool held. The loop ends
    /// after a full pass without a swap. A null result means nothing is reusable and the
    /// caller has to allocate.
    pub fn reclaim(&self, candidate: *mut N) -> *mut N {
        let mut node = candidate;
        loop {
            let mut swapped = false;
            for core in self.cores.iter() {
                if node.is_null() {
                    return node;
                }
                for (hazard, pooled) in core.hazards.iter().zip(core.pooled.iter()) {
                    if hazard.load(Ordering::SeqCst) == node {
                        node = pooled.swap(node, Ordering::AcqRel);
                        swapped = true;
                        break;
                    }
                }
            }
            if !swapped {
                return node;
            }
        }
    }

    /// Number of nodes parked in pool slots.
    pub fn pooled_count(&self) -> usize {
        self.cores
            .iter()
            .flat_map(|core| core.pooled.iter())
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }
}

impl<N> Drop for HazardSlots<N> {
    fn drop(&mut self) {
        for core in self.cores.iter_mut() {
            for slot in core.pooled.iter_mut() {
                let node = std::mem::replace(slot.get_mut(), ptr::null_mut());
                if !node.is_null() {
                    // SAFETY: pooled nodes are unreachable Box allocations owned by the pool.
                    drop(unsafe { Box::from_raw(node) });
                }
            }
        }
    }
}

/// The hazard slots of one core, borrowed for the duration of a queue operation.
pub struct HazardGuard<'a, N> {
    slots: &'a HazardSlots<N>,
    core: usize,
}

impl<N> HazardGuard<'_, N> {
    /// Publishes `node` in hazard slot `index`.
    pub fn set(&self, index: usize, node: *mut N) {
        self.slots.cores[self.core].hazards[index].store(node, Ordering::SeqCst);
    }

    /// Loads `src`, publishes it in slot `index`, and repeats until `src` still holds the
    /// published value. The returned pointer is safe to dereference while the hazard stays
    /// published, provided the value read from `src` was reachable at that point.
    pub fn protect(&self, index: usize, src: &AtomicPtr<N>) -> *mut N {
        let mut node = src.load(Ordering::SeqCst);
        loop {
            self.set(index, node);
            let current = src.load(Ordering::SeqCst);
            if current == node {
                return node;
            }
            node = current;
        }
    }

    pub fn clear(&self) {
        for hazard in self.slots.cores[self.core].hazards.iter() {
            hazard.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

impl<N> Drop for HazardGuard<'_, N> {
    fn drop(&mut self) {
        self.clear();
    }
}
