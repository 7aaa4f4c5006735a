#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional scheduler counters, enabled with the `metrics` feature.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Tasks launched through any spawn path.
    pub tasks_spawned: AtomicU64,
    /// Tasks whose fiber ran to completion.
    pub tasks_completed: AtomicU64,
    /// Total pushes to worker LIFO queues.
    pub local_queue_pushes: AtomicU64,
    /// Total pops from worker LIFO queues.
    pub local_queue_pops: AtomicU64,
    /// Total enqueues on the global queue (spawns, yields and wake-ups).
    pub global_queue_pushes: AtomicU64,
    /// Total successful dequeues from the global queue.
    pub global_queue_pops: AtomicU64,
    /// Fibers parked on a lock or fence.
    pub parks: AtomicU64,
    /// Cooperative yields.
    pub yields: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            tasks_spawned: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            local_queue_pushes: AtomicU64::new(0),
            local_queue_pops: AtomicU64::new(0),
            global_queue_pushes: AtomicU64::new(0),
            global_queue_pops: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            local_queue_pushes: self.local_queue_pushes.load(Ordering::Relaxed),
            local_queue_pops: self.local_queue_pops.load(Ordering::Relaxed),
            global_queue_pushes: self.global_queue_pushes.load(Ordering::Relaxed),
            global_queue_pops: self.global_queue_pops.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub local_queue_pushes: u64,
    pub local_queue_pops: u64,
    pub global_queue_pushes: u64,
    pub global_queue_pops: u64,
    pub parks: u64,
    pub yields: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    pub fn tasks_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.tasks_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximates the total depth of the local queues (pushes - pops).
    pub fn local_queue_depth(&self) -> i64 {
        self.local_queue_pushes as i64 - self.local_queue_pops as i64
    }

    /// Approximates the global queue depth (pushes - pops).
    pub fn global_queue_depth(&self) -> i64 {
        self.global_queue_pushes as i64 - self.global_queue_pops as i64
    }
}
