//! Scheduler configuration.

use crate::PinningStrategy;
use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest fiber stack accepted by [`SchedulerConfig::validate`].
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// How an idle worker polls the global queue: spin first, then yield the OS thread,
/// then sleep between polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Empty polls answered with a CPU spin hint.
    pub spin_iterations: u32,
    /// Further empty polls answered with `thread::yield_now`.
    pub yield_iterations: u32,
    /// Sleep after both budgets are spent.
    pub sleep: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            spin_iterations: 64,
            yield_iterations: 64,
            sleep: Duration::from_micros(100),
        }
    }
}

impl PollPolicy {
    /// Never sleeps. Lowest latency, burns a core per idle worker.
    pub fn busy() -> Self {
        Self {
            spin_iterations: u32::MAX,
            yield_iterations: 0,
            sleep: Duration::ZERO,
        }
    }
}

/// Configuration for a [`FiberSystem`](crate::FiberSystem).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. Default: one per available core.
    pub workers: Option<usize>,
    /// How workers are pinned to cores.
    pub pinning: PinningStrategy,
    /// Stack size for each fiber in bytes. Default: 256KB.
    pub stack_size: usize,
    /// Capacity of each worker's LIFO queue. Default: 20.
    pub local_queue_capacity: usize,
    pub poll: PollPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            pinning: PinningStrategy::None,
            stack_size: 256 * 1024,
            local_queue_capacity: 20,
            poll: PollPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(SchedulerError::InvalidConfig("worker count must be at least 1"));
        }
        if self.local_queue_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "local queue capacity must be at least 1",
            ));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SchedulerError::InvalidConfig(
                "fiber stack size must be at least 16KB",
            ));
        }
        Ok(())
    }
}
