//! Worker thread implementation.
//!
//! Each worker is an OS thread pinned to one core that multiplexes fibers: it picks a
//! ready item, resumes that item's fiber until it suspends or finishes, and repeats.
//! Fibers reach back into their current worker through a thread-local context that
//! holds the worker's index (its hazard slot), its LIFO queue and the previous-fiber
//! slot used for deferred deletion.
//!
//! Fibers migrate between workers, so every thread-local access goes through a
//! non-inlined helper; a TLS address computed before a switch must not be reused after.

use crate::config::PollPolicy;
use crate::error::{Result, SchedulerError};
use crate::fiber::{Fiber, FiberHandle, FiberState, Suspend};
use crate::queue::{ItemRef, LocalQueue};
use crate::scheduler::Shared;
use core_affinity::CoreId;
use crossbeam::channel::{self, Receiver, Sender};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

struct WorkerContext {
    shared: Arc<Shared>,
    index: usize,
    local: RefCell<LocalQueue<ItemRef<FiberHandle>>>,
    /// A finished fiber waiting to be deleted by whatever runs next on this worker.
    previous: Cell<Option<FiberHandle>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

#[inline(never)]
fn with_context<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    CONTEXT
        .try_with(|slot| slot.borrow().as_ref().map(f))
        .ok()
        .flatten()
}

/// The runtime whose worker is running the caller.
#[inline(never)]
pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    with_context(|ctx| ctx.shared.clone())
}

/// Index of the worker running the caller.
#[inline(never)]
pub(crate) fn current_index() -> Option<usize> {
    with_context(|ctx| ctx.index)
}

/// Index of the calling worker, provided it belongs to `shared`.
#[inline(never)]
pub(crate) fn current_index_for(shared: &Shared) -> Option<usize> {
    with_context(|ctx| std::ptr::eq(&*ctx.shared, shared).then_some(ctx.index)).flatten()
}

/// Pushes onto the calling worker's LIFO queue. Hands the item back when the queue is
/// full or the caller is not a worker of `shared`.
#[inline(never)]
pub(crate) fn push_local(
    shared: &Shared,
    item: ItemRef<FiberHandle>,
) -> std::result::Result<(), ItemRef<FiberHandle>> {
    let pushed = CONTEXT.with(|slot| match slot.borrow().as_ref() {
        Some(ctx) if std::ptr::eq(&*ctx.shared, shared) => ctx.local.borrow_mut().try_push(item),
        _ => Err(item),
    });
    #[cfg(feature = "metrics")]
    if pushed.is_ok() {
        shared.record(|m| &m.local_queue_pushes);
    }
    pushed
}

/// Publishes the running fiber for deletion by the next fiber this worker runs.
///
/// # Panics
/// If a predecessor is already published; every fiber reaps before doing anything else.
#[inline(never)]
pub(crate) fn publish_previous(fiber: FiberHandle) {
    with_context(|ctx| {
        let old = ctx.previous.replace(Some(fiber));
        assert!(old.is_none(), "previous fiber published twice");
    });
}

/// Deletes the finished predecessor on this worker, if any.
#[inline(never)]
pub(crate) fn reap_previous() {
    if let Some(Some(previous)) = with_context(|ctx| ctx.previous.take()) {
        // SAFETY: only finished fibers are published, and the publisher has switched
        // out: the caller runs on the same worker after it.
        unsafe { Fiber::delete(previous) };
    }
}

/// Switches the running fiber out, then reaps whatever finished on the worker that
/// resumes it.
pub(crate) fn suspend_current(reason: Suspend) {
    Fiber::suspend(reason);
    reap_previous();
}

/// A worker thread that runs fibers.
pub(crate) struct Worker {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread. It pins itself, reports over `ready`, and waits on
    /// `start` before entering the dispatch loop; a closed `start` channel aborts it.
    fn spawn(
        index: usize,
        core: Option<CoreId>,
        shared: Arc<Shared>,
        ready: Sender<Result<()>>,
        start: Receiver<()>,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("fiber-worker-{index}"))
            .spawn(move || {
                let pinned = match core {
                    Some(core) if !core_affinity::set_for_current(core) => {
                        Err(SchedulerError::Affinity {
                            index,
                            core: core.id,
                        })
                    }
                    _ => Ok(()),
                };
                let ok = pinned.is_ok();
                if ready.send(pinned).is_err() || !ok {
                    return;
                }
                drop(ready);
                if start.recv().is_err() {
                    return;
                }
                drop(start);
                Worker::run(shared, index);
            })?;

        Ok(Worker {
            index,
            handle: Some(handle),
        })
    }

    fn run(shared: Arc<Shared>, index: usize) {
        debug!(worker = index, "worker started");
        CONTEXT.with(|slot| {
            *slot.borrow_mut() = Some(WorkerContext {
                shared: shared.clone(),
                index,
                local: RefCell::new(LocalQueue::with_capacity(
                    shared.config.local_queue_capacity,
                )),
                previous: Cell::new(None),
            })
        });

        let mut idle = IdleBackoff::new(shared.config.poll);
        while let Some(item) = Worker::pick_next(&shared, index, &mut idle) {
            Worker::dispatch(&shared, item);
        }

        reap_previous();
        let leftovers: Vec<_> = with_context(|ctx| {
            let mut local = ctx.local.borrow_mut();
            std::iter::from_fn(|| local.pop()).collect()
        })
        .unwrap_or_default();
        let discarded = leftovers.len();
        for item in leftovers {
            shared.discard(item);
        }
        CONTEXT.with(|slot| slot.borrow_mut().take());
        debug!(worker = index, discarded, "worker stopped");
    }

    /// Local queue first, then the global queue until it yields an item or shutdown
    /// is observed with nothing to dequeue.
    fn pick_next(
        shared: &Shared,
        index: usize,
        idle: &mut IdleBackoff,
    ) -> Option<ItemRef<FiberHandle>> {
        if let Some(item) = with_context(|ctx| ctx.local.borrow_mut().pop()).flatten() {
            #[cfg(feature = "metrics")]
            shared.record(|m| &m.local_queue_pops);
            return Some(item);
        }

        loop {
            if let Some(item) = shared.global.dequeue(index) {
                #[cfg(feature = "metrics")]
                shared.record(|m| &m.global_queue_pops);
                idle.reset();
                return Some(item);
            }
            if shared.is_shutting_down() {
                return None;
            }
            idle.wait();
        }
    }

    fn dispatch(shared: &Shared, item: ItemRef<FiberHandle>) {
        let handle = *item.data();
        // SAFETY: a ready item keeps its fiber alive until the fiber retires it.
        let fiber = unsafe { handle.as_ref() };
        fiber.claim();
        fiber.set_item(item);

        // SAFETY: `claim` gave this worker the run right, and finished fibers are never
        // enqueued again.
        match unsafe { fiber.resume() } {
            // Published itself as this worker's predecessor.
            FiberState::Finished => {}
            // Its item already sits on a wait list.
            FiberState::Suspended(Suspend::Park) => fiber.mark_suspended(),
            FiberState::Suspended(Suspend::Yield) => {
                let item = fiber.take_item();
                fiber.mark_suspended();
                match item {
                    Some(item) => {
                        #[cfg(feature = "metrics")]
                        shared.record(|m| &m.yields);
                        trace!(fiber = ?fiber.id(), "requeueing yielded fiber");
                        shared.make_ready(item);
                    }
                    None => error!(fiber = ?fiber.id(), "yielded fiber lost its ready item"),
                }
            }
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

/// Escalating wait between empty polls of the global queue.
struct IdleBackoff {
    policy: PollPolicy,
    polls: u64,
}

impl IdleBackoff {
    fn new(policy: PollPolicy) -> Self {
        Self { policy, polls: 0 }
    }

    fn reset(&mut self) {
        self.polls = 0;
    }

    fn wait(&mut self) {
        let spins = u64::from(self.policy.spin_iterations);
        let yields = spins + u64::from(self.policy.yield_iterations);
        if self.polls < spins {
            std::hint::spin_loop();
        } else if self.polls < yields || self.policy.sleep.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(self.policy.sleep);
        }
        self.polls = self.polls.saturating_add(1);
    }
}

/// The running worker threads of one fiber system.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawns one worker per entry of `cores` and releases them together once every
    /// one has pinned itself. Any spawn or pin failure aborts all of them.
    pub(crate) fn start(shared: &Arc<Shared>, cores: &[Option<CoreId>]) -> Result<Self> {
        let (ready_tx, ready_rx) = channel::unbounded();
        let (start_tx, start_rx) = channel::unbounded();

        let mut workers = Vec::with_capacity(cores.len());
        let mut failure = None;
        for (index, core) in cores.iter().copied().enumerate() {
            match Worker::spawn(
                index,
                core,
                shared.clone(),
                ready_tx.clone(),
                start_rx.clone(),
            ) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    failure = Some(SchedulerError::ThreadSpawn { index, source });
                    break;
                }
            }
        }
        drop(ready_tx);
        drop(start_rx);

        for _ in 0..workers.len() {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(_) => {
                    failure.get_or_insert(SchedulerError::WorkerPanicked(1));
                    break;
                }
            }
        }

        let pool = WorkerPool { workers };
        if let Some(err) = failure {
            error!(error = %err, "worker startup failed, aborting");
            drop(start_tx);
            if let Err(join_err) = pool.join() {
                warn!(error = %join_err, "aborted workers did not exit cleanly");
            }
            return Err(err);
        }

        for _ in 0..pool.size() {
            // Receivers live until each worker has taken its start message.
            let _ = start_tx.send(());
        }
        Ok(pool)
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Joins every worker, reporting how many panicked.
    pub(crate) fn join(self) -> Result<()> {
        let mut failed = 0;
        for worker in self.workers {
            let index = worker.index();
            if worker.join().is_err() {
                failed += 1;
                error!(worker = index, "worker panicked during execution");
            }
        }
        if failed > 0 {
            Err(SchedulerError::WorkerPanicked(failed))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_no_context_off_worker() {
        assert!(current_shared().is_none());
        assert!(current_index().is_none());
        reap_previous();
    }

    #[test]
    fn test_idle_backoff_escalates_to_sleep() {
        let mut idle = IdleBackoff::new(PollPolicy {
            spin_iterations: 2,
            yield_iterations: 2,
            sleep: Duration::from_millis(5),
        });
        for _ in 0..4 {
            idle.wait();
        }
        let start = Instant::now();
        idle.wait();
        assert!(start.elapsed() >= Duration::from_millis(5));

        idle.reset();
        let start = Instant::now();
        idle.wait();
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn test_failed_pin_aborts_every_worker() {
        use crate::config::SchedulerConfig;

        let shared = Arc::new(Shared::new(SchedulerConfig::with_workers(2), 2));
        // A core id no test machine has: that worker fails to pin, and the healthy one
        // is released without ever entering the dispatch loop.
        let cores = [None, Some(CoreId { id: 1000 })];
        let result = WorkerPool::start(&shared, &cores);
        assert!(result.is_err());
        // Only the pool's clones were dropped; nobody else holds the runtime.
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
