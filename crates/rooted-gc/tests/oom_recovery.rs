//! Out-of-memory recovery through a global collection.

use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;

use rooted_gc::{GcConfig, GcError, Manager};

fn capped(limit: usize) -> Manager {
    Manager::new(GcConfig::default().with_max_heap_bytes(Some(limit)))
}

#[test]
fn test_exhaustion_recovers_after_global_collect() {
    let manager = capped(64);
    let gc = manager.create().unwrap();

    let _garbage = gc.allocate(48).unwrap();
    let block = gc.allocate(32).unwrap();
    assert!(gc.release(block.as_ptr()).unwrap());
    assert_eq!(gc.allocation_count(), 0);

    let metrics = manager.metrics();
    assert_eq!(metrics.oom_recoveries, 1);
    assert_eq!(metrics.global_collections, 1);
    assert_eq!(metrics.fatal_ooms, 0);
}

#[test]
fn test_exhaustion_with_everything_rooted_is_fatal() {
    let manager = capped(64);
    let gc = manager.create().unwrap();

    let slot: *mut u8 = black_box(gc.allocate(32).unwrap().as_ptr());
    unsafe { gc.add_root(&raw const slot).unwrap() };

    let err = gc.allocate(48).unwrap_err();
    assert!(matches!(err, GcError::OutOfMemory { size: 48 }));
    assert_eq!(err.errno(), libc::ENOMEM);
    assert_eq!(gc.allocation_count(), 1);

    let metrics = manager.metrics();
    assert_eq!(metrics.fatal_ooms, 1);
    assert_eq!(metrics.oom_recoveries, 0);
    assert_eq!(metrics.global_collections, 1);

    // Still usable for requests that fit.
    let _small = gc.allocate(16).unwrap();
    assert_eq!(gc.allocation_count(), 2);
    black_box(slot);
}

#[test]
fn test_recovery_reclaims_other_threads_garbage() {
    let manager = Arc::new(capped(64));
    let gc = manager.create().unwrap();
    let _mine = gc.allocate(48).unwrap();

    let ready = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));
    let other = {
        let manager = Arc::clone(&manager);
        let ready = Arc::clone(&ready);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let gc = manager.create().unwrap();
            let _theirs = gc.allocate(40).unwrap();
            ready.wait();
            done.wait();
            assert_eq!(gc.allocation_count(), 0);
        })
    };

    ready.wait();
    assert_eq!(manager.total_allocation_count(), 2);
    let _retry = gc.allocate(32).unwrap();
    assert_eq!(manager.total_allocation_count(), 1);
    assert_eq!(manager.metrics().oom_recoveries, 1);

    done.wait();
    other.join().unwrap();
}
