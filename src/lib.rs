//! # fibersched - Fiber-Based Cooperative Task Scheduler
//!
//! A fixed pool of worker threads, one pinned per selected core, runs a much larger
//! number of lightweight, cooperatively scheduled tasks. Each task runs on its own
//! fiber (a stackful coroutine) and only leaves its core by finishing, yielding, or
//! parking on a synchronization primitive.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful execution contexts, resumed by a per-worker dispatch loop
//! - **Global queue**: lock-free Michael-Scott queue protected by per-core hazard
//!   pointers, recycling its nodes through the items that move across it
//! - **Local queues**: bounded per-worker LIFO stacks that receive newly spawned tasks
//! - **Fences**: countdown latches that park waiting fibers instead of their threads
//! - **FiberLock**: a mutex that parks contending fibers and hands ownership directly
//!   to the next waiter
//!
//! ## Example
//!
//! ```no_run
//! use fibersched::{Fence, FiberSystem, task};
//!
//! let system = FiberSystem::new(4).unwrap();
//! let done = Fence::new(1);
//!
//! system
//!     .spawn(
//!         || {
//!             let children = Fence::new(8);
//!             for i in 0..8 {
//!                 task::spawn(move || println!("child {i}"), Some(children.clone())).unwrap();
//!             }
//!             children.wait_for_signal();
//!         },
//!         Some(done.clone()),
//!     )
//!     .unwrap();
//!
//! done.wait_for_signal();
//! system.shutdown().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod fiber;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod topology;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// One worker per physical core (every other logical processor when SMT is on).
    AvoidSMT,
}

pub use config::{PollPolicy, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use scheduler::{FiberSystem, Handle};
pub use sync::{Fence, FiberLock, FiberLockGuard};
