//! High-level fiber system interface.
//!
//! [`FiberSystem`] owns the worker threads and is the primary entry point. [`Handle`]
//! is a cheap clonable reference to the same runtime for launching tasks from other
//! threads or from inside tasks.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::fiber::{Fiber, FiberHandle};
use crate::queue::{ItemRef, LockFreeQueue};
use crate::sync::Fence;
use crate::worker::{self, WorkerPool};
use crate::{task, topology};
use core_affinity::CoreId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};

/// State shared by the workers, the handles and every fiber of one runtime.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) global: LockFreeQueue<FiberHandle>,
    /// Serializes threads that are not workers of this runtime; they share the last
    /// hazard slot.
    foreign_slot: Mutex<()>,
    shutdown: AtomicBool,
    /// Spawned tasks whose fiber has not finished yet.
    live: AtomicUsize,
    worker_count: usize,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl Shared {
    pub(crate) fn new(config: SchedulerConfig, worker_count: usize) -> Self {
        Self {
            config,
            global: LockFreeQueue::new(worker_count + 1),
            foreign_slot: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            worker_count,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    /// Runs `f` with a hazard slot that is exclusive to the caller for its duration.
    pub(crate) fn with_slot<R>(&self, f: impl FnOnce(usize) -> R) -> R {
        match worker::current_index_for(self) {
            Some(index) => f(index),
            None => {
                let _guard = self.foreign_slot.lock();
                f(self.worker_count)
            }
        }
    }

    /// Puts an item on the global ready queue.
    pub(crate) fn make_ready(&self, item: ItemRef<FiberHandle>) {
        #[cfg(feature = "metrics")]
        self.record(|m| &m.global_queue_pushes);
        self.with_slot(|slot| self.global.enqueue(slot, item));
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn task_started(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
        #[cfg(feature = "metrics")]
        self.record(|m| &m.tasks_spawned);
    }

    pub(crate) fn task_finished(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        #[cfg(feature = "metrics")]
        self.record(|m| &m.tasks_completed);
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Retires a ready item that will never be dispatched. Returns false when its
    /// fiber had already started and has to be leaked.
    pub(crate) fn discard(&self, item: ItemRef<FiberHandle>) -> bool {
        let handle = self.global.release(item);
        // SAFETY: the item was the only route to the fiber, and no worker is running it.
        if unsafe { handle.as_ref().is_started() } {
            return false;
        }
        // SAFETY: never started, so dropping it runs no fiber code.
        unsafe { Fiber::delete(handle) };
        self.live.fetch_sub(1, Ordering::AcqRel);
        true
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn record(&self, counter: impl FnOnce(&Metrics) -> &std::sync::atomic::AtomicU64) {
        counter(&self.metrics).fetch_add(1, Ordering::Relaxed);
    }
}

/// Clonable reference to a running fiber system.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The handle of the fiber system whose worker runs the caller.
    pub fn current() -> Option<Handle> {
        worker::current_shared().map(|shared| Handle { shared })
    }

    /// Launches `work` as a new fiber. `fence`, if any, is signalled once it finishes.
    ///
    /// From a worker the task goes on that worker's LIFO queue, unless it is full; from
    /// anywhere else it goes on the global queue.
    pub fn spawn<F>(&self, work: F, fence: Option<Fence>) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        task::launch(&self.shared, Box::new(work), fence)
    }

    /// Launches `entry(arg)` as a new fiber.
    pub fn spawn_with<A>(&self, entry: fn(A), arg: A, fence: Option<Fence>) -> Result<()>
    where
        A: Send + 'static,
    {
        task::launch(&self.shared, Box::new(move || entry(arg)), fence)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Tasks spawned but not yet finished, including parked ones.
    pub fn live_tasks(&self) -> usize {
        self.shared.live_tasks()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.shared.worker_count)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

/// The fiber scheduler: a pool of worker threads multiplexing fibers.
pub struct FiberSystem {
    handle: Handle,
    workers: Option<WorkerPool>,
    cores: Vec<Option<CoreId>>,
}

impl FiberSystem {
    /// Starts a fiber system with `workers` unpinned worker threads.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fibersched::{Fence, FiberSystem};
    ///
    /// let system = FiberSystem::new(4).unwrap();
    /// let fence = Fence::new(1);
    /// system.spawn(|| println!("Hello from a fiber!"), Some(fence.clone())).unwrap();
    /// fence.wait_for_signal();
    /// system.shutdown().unwrap();
    /// ```
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_config(SchedulerConfig::with_workers(workers))
    }

    /// Starts a fiber system from a full configuration.
    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let cores = topology::select_cores(config.pinning, config.workers)?;
        if cores.is_empty() {
            return Err(SchedulerError::InvalidConfig("no worker threads selected"));
        }

        let pinning = config.pinning;
        let shared = Arc::new(Shared::new(config, cores.len()));
        let workers = WorkerPool::start(&shared, &cores)?;
        info!(workers = workers.size(), ?pinning, "fiber system started");

        Ok(FiberSystem {
            handle: Handle { shared },
            workers: Some(workers),
            cores,
        })
    }

    /// Starts a fiber system with one worker per available core.
    pub fn with_default_workers() -> Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// See [`Handle::spawn`].
    pub fn spawn<F>(&self, work: F, fence: Option<Fence>) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(work, fence)
    }

    /// See [`Handle::spawn_with`].
    pub fn spawn_with<A>(&self, entry: fn(A), arg: A, fence: Option<Fence>) -> Result<()>
    where
        A: Send + 'static,
    {
        self.handle.spawn_with(entry, arg, fence)
    }

    pub fn worker_count(&self) -> usize {
        self.handle.worker_count()
    }

    /// The core each worker was pinned to; `None` for unpinned workers.
    pub fn cores(&self) -> &[Option<CoreId>] {
        &self.cores
    }

    pub fn live_tasks(&self) -> usize {
        self.handle.live_tasks()
    }

    /// Waits for every spawned task to finish, then stops and joins the workers.
    ///
    /// Tasks parked on a fence or lock that is never released keep this waiting.
    pub fn shutdown(mut self) -> Result<()> {
        let mut backoff_us = 1;
        const MAX_BACKOFF_US: u64 = 1000;
        while self.handle.live_tasks() > 0 {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
        self.stop()
    }

    /// Sets the shutdown flag, joins the workers and retires what is left in the
    /// global queue.
    fn stop(&mut self) -> Result<()> {
        let Some(workers) = self.workers.take() else {
            return Ok(());
        };
        let shared = &self.handle.shared;
        shared.shutdown.store(true, Ordering::Release);
        let joined = workers.join();

        let mut discarded = 0;
        let mut leaked = 0;
        while let Some(item) = shared.with_slot(|slot| shared.global.dequeue(slot)) {
            if shared.discard(item) {
                discarded += 1;
            } else {
                leaked += 1;
            }
        }
        if discarded > 0 {
            debug!(discarded, "dropped tasks that never started");
        }
        let unfinished = shared.live_tasks();
        if unfinished > 0 {
            warn!(
                unfinished,
                requeued = leaked,
                "fiber system stopped with suspended tasks; their fibers are leaked"
            );
        }
        info!("fiber system stopped");
        joined
    }
}

impl Drop for FiberSystem {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "fiber system dropped with failed workers");
        }
    }
}
