//! Task launch API and the code every task fiber runs around its work.
//!
//! A task is a boxed closure run on its own fiber. When the closure returns (or
//! panics) the fiber retires itself: it signals its fence, publishes itself for
//! deferred deletion, frees its ready item and finishes. The next fiber to run on the
//! same worker deletes it.

use crate::error::{Result, SchedulerError};
use crate::fiber::{Fiber, Suspend};
use crate::queue::Item;
use crate::scheduler::Shared;
use crate::sync::Fence;
use crate::worker;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Launches `work` on the fiber system running the caller.
///
/// Fails with [`SchedulerError::NoRuntime`] when called from a thread that is not one
/// of its workers; use a [`Handle`](crate::Handle) there.
pub fn spawn<F>(work: F, fence: Option<Fence>) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = worker::current_shared().ok_or(SchedulerError::NoRuntime)?;
    launch(&runtime, Box::new(work), fence)
}

/// Launches `entry(arg)` on the fiber system running the caller.
pub fn spawn_with<A>(entry: fn(A), arg: A, fence: Option<Fence>) -> Result<()>
where
    A: Send + 'static,
{
    spawn(move || entry(arg), fence)
}

/// Gives up the core: the running fiber goes to the back of the global queue. Off a
/// fiber this yields the OS thread instead.
pub fn yield_now() {
    if Fiber::current().is_none() {
        std::thread::yield_now();
        return;
    }
    worker::suspend_current(Suspend::Yield);
}

/// Index of the worker running the caller. Can change across suspension points.
pub fn current_core() -> Option<usize> {
    worker::current_index()
}

pub fn in_fiber() -> bool {
    Fiber::current().is_some()
}

pub(crate) fn launch(runtime: &Arc<Shared>, work: Work, fence: Option<Fence>) -> Result<()> {
    if runtime.is_shutting_down() {
        return Err(SchedulerError::ShuttingDown);
    }

    let task_runtime = runtime.clone();
    let fiber = Fiber::spawn(runtime.config.stack_size, move || {
        run(task_runtime, work, fence)
    })?;
    runtime.task_started();

    match worker::push_local(runtime, Item::new(fiber)) {
        Ok(()) => trace!("enqueued new task on local queue"),
        Err(item) => {
            trace!("enqueued new task on global queue");
            runtime.make_ready(item);
        }
    }
    Ok(())
}

fn run(runtime: Arc<Shared>, work: Work, fence: Option<Fence>) {
    worker::reap_previous();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
        error!(panic = panic_message(&*payload), "task panicked");
    }
    retire(&runtime, fence);
}

/// Runs on the fiber's own stack right before it finishes.
fn retire(runtime: &Shared, fence: Option<Fence>) {
    if let Some(fence) = fence {
        fence.signal();
    }

    let Some(current) = Fiber::current() else {
        return;
    };
    worker::publish_previous(current);
    // SAFETY: the running fiber is alive until its successor reaps it.
    if let Some(item) = unsafe { current.as_ref() }.take_item() {
        let _ = runtime.global.release(item);
    }
    runtime.task_finished();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
