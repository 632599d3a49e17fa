//! Global collections racing with threads that are busy inside the manager.

use std::hint::black_box;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crossbeam::channel::bounded;
use rooted_gc::{CollectScope, GcConfig, Manager};

const MUTATORS: usize = 4;
const GLOBAL_RUNS: usize = 25;
const QUERY_RUNS: usize = 2000;

#[test]
fn test_global_collections_interleave_with_busy_mutators() {
    let manager: &'static Manager =
        Box::leak(Box::new(Manager::new(GcConfig::default().with_min_workers(2))));
    let gc = manager.create().unwrap();

    let started = Arc::new(Barrier::new(MUTATORS + 1));
    let finished = Arc::new(AtomicBool::new(false));

    let mutators: Vec<_> = (0..MUTATORS)
        .map(|id| {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let gc = manager.create().unwrap();
                let keep = gc.allocate(64).unwrap().as_ptr();
                let marker = u8::try_from(id).unwrap() + 0x40;
                unsafe { keep.write(marker) };
                let slot: *mut u8 = black_box(keep);
                unsafe { gc.add_root(&raw const slot).unwrap() };

                started.wait();
                let mut iterations = 0usize;
                while !finished.load(Ordering::SeqCst) || iterations < 50 {
                    let scratch = gc.allocate(16 + iterations % 48).unwrap();
                    // A concurrent global run may already have swept it.
                    let _ = gc.release(scratch.as_ptr()).unwrap();
                    if iterations % 10 == 0 {
                        gc.collect(CollectScope::ThreadLocal).unwrap();
                    }
                    iterations += 1;
                }

                gc.collect(CollectScope::ThreadLocal).unwrap();
                assert_eq!(gc.allocation_count(), 1);
                assert_eq!(unsafe { ptr::read_volatile(slot) }, marker);
                black_box(slot);
            })
        })
        .collect();

    started.wait();
    for _ in 0..GLOBAL_RUNS {
        gc.collect(CollectScope::Global).unwrap();
        thread::yield_now();
    }
    finished.store(true, Ordering::SeqCst);

    for mutator in mutators {
        mutator.join().unwrap();
    }

    let metrics = manager.metrics();
    assert_eq!(metrics.global_collections, GLOBAL_RUNS);
    assert_eq!(manager.registered_threads(), vec![gc.key()]);
    assert_eq!(manager.total_allocation_count(), 0);
}

#[test]
fn test_queries_from_running_peer_do_not_stall_global_collection() {
    let manager: &'static Manager = Box::leak(Box::new(Manager::new(GcConfig::default())));
    let registered = Arc::new(Barrier::new(2));
    let stop = Arc::new(AtomicBool::new(false));

    let peer = {
        let registered = Arc::clone(&registered);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let gc = manager.create().unwrap();
            registered.wait();
            let mut queries = 0usize;
            while !stop.load(Ordering::SeqCst) {
                black_box(manager.worker_count());
                black_box(manager.is_registered(gc.key()));
                black_box(manager.registered_threads());
                black_box(manager.is_collecting());
                queries += 1;
            }
            assert!(queries > 0);
        })
    };

    let (done_tx, done_rx) = bounded(1);
    let initiator = thread::spawn(move || {
        let gc = manager.create().unwrap();
        registered.wait();
        for _ in 0..QUERY_RUNS {
            gc.collect(CollectScope::Global).unwrap();
        }
        done_tx.send(manager.metrics().global_collections).unwrap();
    });

    let runs = done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("global collections stalled behind a querying thread");
    assert_eq!(runs, QUERY_RUNS);

    stop.store(true, Ordering::SeqCst);
    initiator.join().unwrap();
    peer.join().unwrap();
    assert!(manager.registered_threads().is_empty());
}
