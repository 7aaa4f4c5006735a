//! Core enumeration and worker placement.

use crate::PinningStrategy;
use crate::error::{Result, SchedulerError};
use core_affinity::CoreId;

/// Logical cores this process may run on, in OS order.
pub fn available_cores() -> Vec<CoreId> {
    core_affinity::get_core_ids().unwrap_or_default()
}

/// Number of logical processors.
pub fn logical_core_count() -> usize {
    num_cpus::get()
}

/// Number of physical cores, ignoring SMT siblings.
pub fn physical_core_count() -> usize {
    num_cpus::get_physical()
}

/// Whether the machine exposes more logical than physical cores.
pub fn has_smt() -> bool {
    physical_core_count() < logical_core_count()
}

/// Picks the core each worker pins to; `None` entries run unpinned.
///
/// Without an explicit `requested` count there is one worker per selected core. With
/// one, workers beyond the selected cores wrap around onto them.
pub fn select_cores(
    strategy: PinningStrategy,
    requested: Option<usize>,
) -> Result<Vec<Option<CoreId>>> {
    if strategy == PinningStrategy::None {
        let count = requested.unwrap_or_else(logical_core_count);
        return Ok(vec![None; count]);
    }

    let cores = available_cores();
    if cores.is_empty() {
        return Err(SchedulerError::NoCores);
    }

    let selected: Vec<CoreId> = match strategy {
        // Siblings are enumerated next to each other, so every other logical core is
        // one per physical core.
        PinningStrategy::AvoidSMT if has_smt() => cores.into_iter().step_by(2).collect(),
        _ => cores,
    };

    let count = requested.unwrap_or(selected.len());
    Ok((0..count)
        .map(|worker| Some(selected[worker % selected.len()]))
        .collect())
}
