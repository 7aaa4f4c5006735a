//! Bounded LIFO ready queue owned by a single worker.
//!
//! No synchronization: only the owning worker thread ever touches it. Newly spawned
//! tasks land here first, so the most recently created task runs next on that worker.

/// Fixed-capacity stack.
#[derive(Debug)]
pub struct LocalQueue<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> LocalQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Pushes onto the top of the stack.
    ///
    /// Callers check [`is_full`](Self::is_full) first; pushing onto a full queue is a bug.
    pub fn push(&mut self, item: T) {
        debug_assert!(!self.is_full(), "push onto a full local queue");
        self.items.push(item);
    }

    /// Pushes unless full, handing the item back otherwise.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
