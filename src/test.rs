use crate::{Config, RecycleError, Recycled, Recycler};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc,
};
use std::thread;
use std::time::Duration;

struct Widget {
    serial: usize,
    payload: Vec<u8>,
}

// Every widget gets a serial from the factory, so tests can tell a reused
// value from a fresh allocation.
fn widget_pool(config: Config) -> (Recycler<Widget>, Arc<AtomicUsize>) {
    let made = Arc::new(AtomicUsize::new(0));
    let counter = made.clone();
    let pool = Recycler::with_config(config, move || Widget {
        serial: counter.fetch_add(1, Ordering::Relaxed),
        payload: Vec::new(),
    })
    .unwrap();
    (pool, made)
}

#[test]
fn same_value_is_reused_on_the_owner_thread() {
    let (pool, made) = widget_pool(Config::default());
    let w = pool.acquire().unwrap();
    assert_eq!(w.serial, 0);
    w.recycle().unwrap();
    let w = pool.acquire().unwrap();
    assert_eq!(w.serial, 0);
    assert_eq!(made.load(Ordering::Relaxed), 1);
}

#[test]
fn foreign_release_comes_back_to_the_owner() {
    let (pool, _) = widget_pool(Config::default());
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let (serial_a, serial_b) = (a.serial, b.serial);
    thread::spawn(move || {
        a.recycle().unwrap();
        b.recycle().unwrap();
    })
    .join()
    .unwrap();
    // the first staged release is admitted by the drop policy and must be
    // visible to the very next acquire
    let first = pool.acquire().unwrap();
    assert_eq!(first.serial, serial_a);
    // the second was dropped during transfer, so this one is fresh
    let second = pool.acquire().unwrap();
    assert_ne!(second.serial, serial_b);
}

#[test]
fn double_recycle_is_detected_across_threads() {
    let (pool, _) = widget_pool(Config::default());
    let obj = pool.acquire().unwrap();
    let handle = obj.handle();
    thread::spawn(move || obj.recycle().unwrap()).join().unwrap();
    let result = thread::spawn(move || handle.recycle()).join().unwrap();
    assert_eq!(result, Err(RecycleError::DoubleRecycle));
}

#[test]
fn double_recycle_is_detected_on_the_owner_thread() {
    let (pool, _) = widget_pool(Config::default());
    let obj = pool.acquire().unwrap();
    let handle = obj.handle();
    obj.recycle().unwrap();
    assert_eq!(handle.recycle(), Err(RecycleError::DoubleRecycle));
}

#[test]
fn zero_capacity_disables_pooling() {
    let config = Config { max_capacity_per_thread: 0, ..Config::default() };
    let (pool, made) = widget_pool(config);
    let mut batch = Vec::new();
    for _ in 0..1000 {
        batch.push(pool.acquire().unwrap());
    }
    for w in batch.drain(..) {
        w.recycle().unwrap();
    }
    for _ in 0..1000 {
        batch.push(pool.acquire().unwrap());
    }
    // nothing was pooled, every acquire hit the factory
    assert_eq!(made.load(Ordering::Relaxed), 2000);
}

#[test]
fn shared_capacity_accounting_holds_under_load() {
    let config = Config { max_delayed_queues_per_thread: 64, ..Config::default() };
    let (pool, _) = widget_pool(config);
    let stack = pool.stack_for_test().unwrap();
    let initial = stack.shared_initial();

    let mut batches = Vec::new();
    for _ in 0..16 {
        let mut batch = Vec::with_capacity(10_000);
        for _ in 0..10_000 {
            batch.push(pool.acquire().unwrap());
        }
        batches.push(batch);
    }
    let threads: Vec<_> = batches
        .into_iter()
        .map(|batch| {
            thread::spawn(move || {
                for w in batch {
                    drop(w);
                }
            })
        })
        .collect();

    // reservations move from the counter into queues, never out of thin air
    for _ in 0..50 {
        let reserved = stack.reserved_in_queues();
        let available = stack.shared_available();
        assert!(reserved + available <= initial);
        thread::sleep(Duration::from_millis(1));
    }
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(stack.reserved_in_queues() + stack.shared_available(), initial);
}

#[test]
fn drop_policy_admits_one_in_eight_fresh_releases() {
    let (pool, _) = widget_pool(Config::default());
    let mut held = Vec::new();
    for _ in 0..64 {
        held.push(pool.acquire().unwrap());
    }
    for w in held.drain(..) {
        w.recycle().unwrap();
    }
    assert_eq!(pool.thread_local_size(), 8);
}

#[test]
fn stack_never_exceeds_max_capacity() {
    let config = Config {
        max_capacity_per_thread: 16,
        ratio: 1, // admit every release
        ..Config::default()
    };
    let (pool, _) = widget_pool(config);
    let mut held: Vec<_> = (0..64).map(|_| pool.acquire().unwrap()).collect();
    for w in held.drain(..) {
        w.recycle().unwrap();
    }
    assert_eq!(pool.thread_local_size(), 16);
}

#[test]
fn drop_test_flag_is_sticky() {
    let (pool, made) = widget_pool(Config::default());
    let w = pool.acquire().unwrap();
    w.recycle().unwrap();
    // once admitted, the same handle keeps its seat and never advances the
    // admission counter again
    for _ in 0..20 {
        let w = pool.acquire().unwrap();
        assert_eq!(w.serial, 0);
        w.recycle().unwrap();
    }
    assert_eq!(made.load(Ordering::Relaxed), 1);
}

#[test]
fn foreign_thread_quota_drops_further_targets() {
    let config = Config { max_delayed_queues_per_thread: 1, ..Config::default() };
    let (pool_a, _) = widget_pool(config);
    let (pool_b, _) = widget_pool(config);
    let a = pool_a.acquire().unwrap();
    let b = pool_b.acquire().unwrap();
    let (serial_a, serial_b) = (a.serial, b.serial);
    thread::spawn(move || {
        a.recycle().unwrap(); // first target stack gets this thread's queue
        b.recycle().unwrap(); // second target is over quota, dropped
    })
    .join()
    .unwrap();
    assert_eq!(pool_a.acquire().unwrap().serial, serial_a);
    assert_ne!(pool_b.acquire().unwrap().serial, serial_b);
}

#[test]
fn exhausted_shared_capacity_drops_releases() {
    let config = Config {
        max_capacity_per_thread: 32,
        shared_capacity_factor: 32, // shared budget collapses to one link
        ratio: 1,
        ..Config::default()
    };
    let (pool, _) = widget_pool(config);
    let held: Vec<_> = (0..40).map(|_| pool.acquire().unwrap()).collect();
    thread::spawn(move || {
        for w in held {
            w.recycle().unwrap();
        }
    })
    .join()
    .unwrap();
    let mut reused = 0;
    for _ in 0..40 {
        let w = pool.acquire().unwrap();
        if w.serial < 40 {
            reused += 1;
        }
        drop(w.detach());
    }
    assert_eq!(reused, 16);
}

#[test]
fn dead_thread_queue_is_drained_and_unlinked() {
    let (pool, _) = widget_pool(Config::default());
    let guards: Vec<_> = (0..10).map(|_| pool.acquire().unwrap()).collect();
    thread::spawn(move || {
        for g in guards {
            g.recycle().unwrap();
        }
    })
    .join()
    .unwrap();
    let w = pool.acquire().unwrap();
    assert!(w.serial < 10);
}

#[test]
fn detach_removes_the_value_from_pool_management() {
    let (pool, _) = widget_pool(Config::default());
    let w = pool.acquire().unwrap();
    let h = w.handle();
    let detached = w.detach();
    assert_eq!(detached.serial, 0);
    assert_eq!(h.recycle(), Err(RecycleError::DoubleRecycle));
    assert_eq!(pool.acquire().unwrap().serial, 1);
}

#[test]
fn handle_identity_is_stable_across_cycles() {
    let (pool, _) = widget_pool(Config::default());
    let w = pool.acquire().unwrap();
    let h1 = w.handle();
    let h2 = w.handle();
    assert!(h1.same_handle(&h2));
    w.recycle().unwrap();
    let w = pool.acquire().unwrap();
    assert!(w.handle().same_handle(&h1));
}

#[test]
fn inconsistent_recycle_ids_are_reported_on_pop() {
    let (pool, _) = widget_pool(Config::default());
    let w = pool.acquire().unwrap();
    let h = w.handle();
    w.recycle().unwrap();
    // simulate a racing foreign release tagging an already pooled handle
    h.mark_queued(0xDEAD);
    assert_eq!(pool.acquire().map(|_| ()), Err(RecycleError::InconsistentHandle));
}

#[test]
fn producer_consumer_stress_keeps_values_consistent() {
    let (pool, _) = widget_pool(Config::default());
    let (tx, rx) = mpsc::channel::<Recycled<Widget>>();
    let consumer = thread::spawn(move || {
        for mut w in rx {
            assert_eq!(w.payload.len(), 4);
            let first = w.payload[0];
            assert!(w.payload.iter().all(|b| *b == first));
            w.payload.clear();
            drop(w); // recycles from this foreign thread
        }
    });
    for i in 0..10_000usize {
        let mut w = pool.acquire().unwrap();
        assert!(w.payload.is_empty());
        let tag = (i % 251) as u8;
        w.payload.extend_from_slice(&[tag; 4]);
        tx.send(w).unwrap();
    }
    drop(tx);
    consumer.join().unwrap();
}
