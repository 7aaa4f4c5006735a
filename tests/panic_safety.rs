use fibersched::{Fence, FiberSystem};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[test]
fn test_panic_safety_fence_signal() {
    let system = FiberSystem::new(1).unwrap();
    let fence = Fence::new(1);

    system
        .spawn(|| panic!("Intentional panic for testing"), Some(fence.clone()))
        .unwrap();

    // The fence is signalled even though the task panicked.
    fence.wait_for_signal();
    assert!(fence.is_signaled());
    system.shutdown().unwrap();
}

#[test]
fn test_worker_recovery_after_panic() {
    let system = FiberSystem::new(1).unwrap();

    let fence = Fence::new(1);
    system.spawn(|| panic!("Boom"), Some(fence.clone())).unwrap();
    fence.wait_for_signal();

    // The same worker keeps running subsequent tasks.
    let success = Arc::new(AtomicBool::new(false));
    let success_clone = success.clone();
    let second = Fence::new(1);
    system
        .spawn(
            move || success_clone.store(true, Ordering::SeqCst),
            Some(second.clone()),
        )
        .unwrap();

    let start = Instant::now();
    while !second.is_signaled() {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("Worker did not process subsequent task!");
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(success.load(Ordering::SeqCst), "Subsequent task failed to run");
    system.shutdown().unwrap();
}

#[test]
fn test_panic_with_string_payload() {
    let system = FiberSystem::new(2).unwrap();
    let fence = Fence::new(10);
    for i in 0..10 {
        system
            .spawn(
                move || {
                    if i % 2 == 0 {
                        panic!("task {i} failed");
                    }
                },
                Some(fence.clone()),
            )
            .unwrap();
    }
    fence.wait_for_signal();
    system.shutdown().unwrap();
}
