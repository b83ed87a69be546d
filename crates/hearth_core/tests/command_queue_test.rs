//! Integration tests for the cross-thread command queue.

use crossbeam_channel::{bounded, unbounded};
use hearth_core::{CommandQueue, CowData, QueueConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Spawns a consumer that sleeps on the signalling semaphore until an exit
/// command runs.
fn spawn_consumer(queue: &Arc<CommandQueue>) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
    let exit = Arc::new(AtomicBool::new(false));
    let handle = {
        let queue = Arc::clone(queue);
        let exit = Arc::clone(&exit);
        thread::spawn(move || {
            while !exit.load(Ordering::Acquire) {
                queue.wait_and_flush_one();
            }
            queue.flush_all();
        })
    };
    (exit, handle)
}

fn stop_consumer(queue: &CommandQueue, exit: Arc<AtomicBool>, handle: thread::JoinHandle<()>) {
    queue.push(move || exit.store(true, Ordering::Release));
    handle.join().unwrap();
}

#[test]
fn test_push_order_is_preserved() {
    let queue = CommandQueue::new(QueueConfig::default()).unwrap();
    let (tx, rx) = unbounded();
    for i in 1..=3 {
        let tx = tx.clone();
        queue.push(move || tx.send(i).unwrap());
    }
    assert_eq!(queue.flush_all(), 3);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn test_push_and_sync_sees_result() {
    let queue = Arc::new(CommandQueue::new(QueueConfig::signalled()).unwrap());
    let (exit, consumer) = spawn_consumer(&queue);

    let mut x = 0;
    queue.push_and_sync(|| x = 42);
    assert_eq!(x, 42);

    let name = String::from("render");
    let len = queue.push_and_ret(|| name.len());
    assert_eq!(len, 6);

    stop_consumer(&queue, exit, consumer);
}

#[test]
fn test_wrap_around_small_arena() {
    const COMMANDS: usize = 10_000;

    let config = QueueConfig::signalled().with_arena_size(1024);
    let queue = Arc::new(CommandQueue::new(config).unwrap());
    let (exit, consumer) = spawn_consumer(&queue);

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..COMMANDS {
        let hits = Arc::clone(&hits);
        queue.push(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        });
    }
    stop_consumer(&queue, exit, consumer);

    assert_eq!(hits.load(Ordering::Relaxed), COMMANDS);
    let cursors = queue.cursors();
    assert_eq!(cursors.read, cursors.write);
    assert_eq!(cursors.dealloc, cursors.read);

    let stats = queue.stats();
    assert_eq!(stats.pushed, stats.flushed);
    assert!(stats.wraps > 0);
}

#[test]
fn test_flush_all_reclaims_everything() {
    let queue = CommandQueue::new(QueueConfig::default().with_arena_size(4096)).unwrap();
    for _ in 0..20 {
        queue.push(|| {});
    }
    assert_eq!(queue.flush_all(), 20);

    let cursors = queue.cursors();
    assert_eq!(cursors.read, cursors.write);
    assert_eq!(cursors.dealloc, cursors.read);
    assert!(queue.is_empty());
}

#[test]
fn test_backpressure_blocks_then_releases() {
    const COMMANDS: usize = 200;

    let queue = Arc::new(CommandQueue::new(QueueConfig::default().with_arena_size(256)).unwrap());
    let hits = Arc::new(AtomicUsize::new(0));

    let producer = {
        let queue = Arc::clone(&queue);
        let hits = Arc::clone(&hits);
        thread::spawn(move || {
            for _ in 0..COMMANDS {
                let hits = Arc::clone(&hits);
                queue.push(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
            }
        })
    };

    // No consumer yet: the ring fills and the producer parks.
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());
    assert!(queue.stats().backpressure_waits > 0);
    assert_eq!(hits.load(Ordering::Relaxed), 0);

    while !producer.is_finished() {
        queue.flush_all();
        thread::yield_now();
    }
    producer.join().unwrap();
    queue.flush_all();

    assert_eq!(hits.load(Ordering::Relaxed), COMMANDS);
    assert_eq!(queue.stats().pushed, COMMANDS as u64);
}

#[test]
fn test_live_head_record_holds_reclamation() {
    const COMMANDS: usize = 100;

    let queue = Arc::new(CommandQueue::new(QueueConfig::default().with_arena_size(256)).unwrap());
    let (parked_tx, parked_rx) = bounded(0);
    let (release_tx, release_rx) = bounded::<()>(0);
    queue.push(move || {
        parked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || assert!(queue.flush_one()))
    };
    parked_rx.recv().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let producer = {
        let queue = Arc::clone(&queue);
        let hits = Arc::clone(&hits);
        thread::spawn(move || {
            for _ in 0..COMMANDS {
                let hits = Arc::clone(&hits);
                queue.push(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
            }
        })
    };
    while queue.stats().backpressure_waits == 0 {
        thread::yield_now();
    }

    // The running head record pins the dealloc cursor, so the producer
    // cannot reuse its bytes or anything behind it.
    let cursors = queue.cursors();
    assert_eq!(cursors.dealloc, 0);
    assert!(cursors.read > 0);
    assert!(!producer.is_finished());
    assert_eq!(hits.load(Ordering::Relaxed), 0);

    release_tx.send(()).unwrap();
    consumer.join().unwrap();
    while !producer.is_finished() {
        queue.flush_all();
        thread::yield_now();
    }
    producer.join().unwrap();
    queue.flush_all();

    assert_eq!(hits.load(Ordering::Relaxed), COMMANDS);
    let stats = queue.stats();
    assert_eq!(stats.pushed, COMMANDS as u64 + 1);
    assert_eq!(stats.flushed, stats.pushed);
    let cursors = queue.cursors();
    assert_eq!(cursors.dealloc, cursors.write);
}

#[test]
fn test_multi_producer_fifo_per_producer() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2_000;

    let config = QueueConfig::signalled().with_arena_size(2048);
    let queue = Arc::new(CommandQueue::new(config).unwrap());
    let (exit, consumer) = spawn_consumer(&queue);
    let (tx, rx) = unbounded();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let tx = tx.clone();
                    queue.push(move || tx.send((p, seq)).unwrap());
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    stop_consumer(&queue, exit, consumer);
    drop(tx);

    let mut next = [0_usize; PRODUCERS];
    let mut total = 0;
    for (p, seq) in rx.iter() {
        assert_eq!(seq, next[p], "producer {p} ran out of order");
        next[p] += 1;
        total += 1;
    }
    assert_eq!(total, PRODUCERS * PER_PRODUCER);
}

#[test]
fn test_sync_slot_exhaustion_is_survivable() {
    const PRODUCERS: usize = 6;
    const CALLS: usize = 200;

    let config = QueueConfig::signalled().with_sync_slots(2);
    let queue = Arc::new(CommandQueue::new(config).unwrap());
    let (exit, consumer) = spawn_consumer(&queue);
    let total = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let total = Arc::clone(&total);
            thread::spawn(move || {
                for i in 0..CALLS {
                    let got = queue.push_and_ret(|| {
                        total.fetch_add(1, Ordering::Relaxed);
                        i * 2
                    });
                    assert_eq!(got, i * 2);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    stop_consumer(&queue, exit, consumer);

    assert_eq!(total.load(Ordering::Relaxed), PRODUCERS * CALLS);
}

#[test]
fn test_cow_payload_crosses_threads() {
    let queue = Arc::new(CommandQueue::new(QueueConfig::signalled()).unwrap());
    let (exit, consumer) = spawn_consumer(&queue);
    let (tx, rx) = unbounded();

    let mesh = CowData::from_slice(&[0.0_f32, 1.0, 2.0]).unwrap();
    let shared = mesh.clone();
    assert_eq!(mesh.refcount(), 2);

    queue.push(move || {
        let mut local = shared;
        local.set(0, 9.0);
        tx.send(local).unwrap();
    });
    let forked = rx.recv().unwrap();
    stop_consumer(&queue, exit, consumer);

    assert_eq!(forked, [9.0, 1.0, 2.0]);
    assert_eq!(mesh, [0.0, 1.0, 2.0]);
    assert!(!mesh.is_shared());
}

#[test]
fn test_dropping_queue_releases_captures() {
    let payload = Arc::new(String::from("texture"));
    {
        let queue = CommandQueue::new(QueueConfig::default()).unwrap();
        for _ in 0..10 {
            let payload = Arc::clone(&payload);
            queue.push(move || drop(payload));
        }
        queue.flush_one();
    }
    assert_eq!(Arc::strong_count(&payload), 1);
}
