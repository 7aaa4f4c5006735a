use fibersched::queue::WorkStealingQueue;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn test_deque_ordering_lifo_local() {
    let queue = WorkStealingQueue::<i32, 8>::new();
    queue.enqueue(1).unwrap();
    queue.enqueue(2).unwrap();
    queue.enqueue(3).unwrap();

    assert_eq!(queue.dequeue(), Some(3));
    assert_eq!(queue.dequeue(), Some(2));
    assert_eq!(queue.dequeue(), Some(1));
    assert_eq!(queue.dequeue(), None);
}

#[test]
fn test_deque_ordering_fifo_steal() {
    let queue = WorkStealingQueue::<i32, 8>::new();
    queue.enqueue(1).unwrap();
    queue.enqueue(2).unwrap();
    queue.enqueue(3).unwrap();

    let stealer = queue.stealer();
    assert_eq!(stealer.steal(), Some(1));
    assert_eq!(stealer.steal(), Some(2));
    assert_eq!(stealer.steal(), Some(3));
    assert_eq!(stealer.steal(), None);
}

#[test]
fn test_last_element_goes_to_exactly_one_side() {
    for _ in 0..2_000 {
        let queue = WorkStealingQueue::<u32, 4>::new();
        queue.enqueue(7).unwrap();
        let stealer = queue.stealer();

        let thief = thread::spawn(move || stealer.steal());
        let owner = queue.dequeue();
        let stolen = thief.join().unwrap();

        assert!(
            owner.is_some() ^ stolen.is_some(),
            "owner {owner:?}, thief {stolen:?}"
        );
    }
}

#[test]
fn test_concurrent_steals_see_each_item_once() {
    const ITEMS: usize = 20_000;
    let queue = WorkStealingQueue::<usize, 64>::new();
    let done = Arc::new(AtomicBool::new(false));

    let thieves: Vec<_> = (0..3)
        .map(|_| {
            let stealer = queue.stealer();
            let done = done.clone();
            thread::spawn(move || {
                let mut stolen = Vec::new();
                loop {
                    match stealer.steal() {
                        Some(value) => stolen.push(value),
                        None if done.load(Ordering::SeqCst) && stealer.is_empty() => break,
                        None => thread::yield_now(),
                    }
                }
                stolen
            })
        })
        .collect();

    let mut popped = Vec::new();
    let mut next = 0;
    while next < ITEMS {
        match queue.enqueue(next) {
            Ok(()) => next += 1,
            Err(_) => {
                if let Some(value) = queue.dequeue() {
                    popped.push(value);
                }
            }
        }
    }
    while let Some(value) = queue.dequeue() {
        popped.push(value);
    }
    done.store(true, Ordering::SeqCst);

    let mut seen: HashSet<usize> = popped.into_iter().collect();
    let mut count = seen.len();
    for thief in thieves {
        for value in thief.join().unwrap() {
            assert!(seen.insert(value), "value {value} taken twice");
            count += 1;
        }
    }
    assert_eq!(count, ITEMS);
    assert_eq!(seen.len(), ITEMS);
}
