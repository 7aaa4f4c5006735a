use fibersched::{Fence, FiberLock, FiberSystem, PinningStrategy, SchedulerConfig, task};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CHAINS: usize = 800;

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Per-worker bookkeeping shared by the demo tasks.
struct Tally {
    lock: FiberLock,
    started: Vec<AtomicUsize>,
    unlocked: Vec<AtomicUsize>,
}

impl Tally {
    fn new(workers: usize) -> Self {
        Self {
            lock: FiberLock::new(),
            started: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            unlocked: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn record(&self) {
        if let Some(core) = task::current_core() {
            self.started[core].fetch_add(1, Ordering::Relaxed);
        }
        let _guard = self.lock.lock();
        // May run on a different worker than the one that started us.
        if let Some(core) = task::current_core() {
            self.unlocked[core].fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn main() -> fibersched::Result<()> {
    init_logging();

    let workers = fibersched::topology::logical_core_count().clamp(1, 8);
    let system = FiberSystem::with_config(SchedulerConfig {
        pinning: PinningStrategy::None,
        ..SchedulerConfig::with_workers(workers)
    })?;
    println!("fibersched demo: {workers} workers, {CHAINS} task pairs\n");

    let tally = Arc::new(Tally::new(workers));
    let done = Fence::new(1);
    let start = Instant::now();

    let root_tally = tally.clone();
    system.spawn(
        move || {
            let children = Fence::new(CHAINS * 2);
            for _ in 0..CHAINS {
                let gate = Fence::new(1);

                // The follow-up only runs once its predecessor has opened the gate.
                let (waiter_tally, waiter_gate, waiter_done) =
                    (root_tally.clone(), gate.clone(), children.clone());
                let spawned = task::spawn(
                    move || {
                        waiter_gate.wait_for_signal();
                        waiter_tally.record();
                    },
                    Some(waiter_done),
                );

                let opener_tally = root_tally.clone();
                let spawned = spawned.and_then(|()| {
                    task::spawn(
                        move || {
                            opener_tally.record();
                            gate.signal();
                        },
                        Some(children.clone()),
                    )
                });
                if let Err(err) = spawned {
                    tracing::error!(error = %err, "failed to launch demo task");
                    return;
                }
            }
            children.wait_for_signal();
        },
        Some(done.clone()),
    )?;

    done.wait_for_signal();
    let elapsed = start.elapsed();

    println!("{:>8} {:>10} {:>10}", "worker", "started", "unlocked");
    for core in 0..workers {
        println!(
            "{core:>8} {:>10} {:>10}",
            tally.started[core].load(Ordering::Relaxed),
            tally.unlocked[core].load(Ordering::Relaxed),
        );
    }
    let total: usize = tally
        .unlocked
        .iter()
        .map(|count| count.load(Ordering::Relaxed))
        .sum();
    println!("\n{total} tasks passed the lock in {elapsed:?}");

    #[cfg(feature = "metrics")]
    {
        let metrics = system.handle().metrics();
        println!("{metrics:#?}");
        println!("tasks/sec: {:.0}", metrics.tasks_per_second());
    }

    system.shutdown()
}
