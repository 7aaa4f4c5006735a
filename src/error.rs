//! Error types for the fiber scheduler.

use thiserror::Error;

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced while starting the scheduler or launching tasks.
///
/// Everything here is a setup failure. Once workers are running, scheduling itself
/// has no failure path: empty queues are `None`, not errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("could not allocate a {size}-byte fiber stack")]
    FiberStack {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("could not spawn worker thread {index}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("could not pin worker {index} to core {core}")]
    Affinity { index: usize, core: usize },

    #[error("core pinning requested but no cores could be enumerated")]
    NoCores,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("not running on a fiber system worker")]
    NoRuntime,

    #[error("fiber system is shutting down")]
    ShuttingDown,

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}
