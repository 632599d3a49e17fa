//! Stop-the-world collection across registered threads.

use std::hint::black_box;
use std::ptr;
use std::sync::{Arc, Barrier};
use std::thread;

use rooted_gc::{Manager, GLOBAL};

const WORKERS: usize = 9;
const ROUNDS: usize = 3;

#[test]
fn test_global_collect_keeps_only_rooted_allocations() {
    let manager = Manager::global();
    let gc = manager.create().unwrap();

    let allocated = Arc::new(Barrier::new(WORKERS + 1));
    let collected = Arc::new(Barrier::new(WORKERS + 1));

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let allocated = Arc::clone(&allocated);
            let collected = Arc::clone(&collected);
            thread::spawn(move || {
                let gc = rooted_gc::create().unwrap();
                let mut slot: *mut u8 = ptr::null_mut();

                for round in 0..ROUNDS {
                    let block = gc.allocate(32).unwrap().as_ptr();
                    unsafe {
                        block.write(u8::try_from(round).unwrap() + 1);
                        ptr::write_volatile(&raw mut slot, block);
                        gc.add_root(&raw const slot).unwrap();
                    }
                }
                assert_eq!(gc.root_count(), 1);
                assert_eq!(gc.allocation_count(), ROUNDS);

                allocated.wait();
                collected.wait();

                assert_eq!(gc.allocation_count(), 1);
                let survivor = unsafe { ptr::read_volatile(&raw const slot) };
                assert_eq!(unsafe { survivor.read() }, 3);
                black_box(slot);
            })
        })
        .collect();

    allocated.wait();
    assert_eq!(manager.registered_threads().len(), WORKERS + 1);
    assert_eq!(manager.total_allocation_count(), WORKERS * ROUNDS);

    let stats = manager.collect_flag(gc.key(), GLOBAL).unwrap();
    assert_eq!(stats.objects_reclaimed, WORKERS * (ROUNDS - 1));
    assert_eq!(stats.objects_surviving, WORKERS);
    assert_eq!(manager.total_allocation_count(), WORKERS);

    let metrics = manager.metrics();
    assert_eq!(metrics.global_collections, 1);
    assert_eq!(metrics.objects_reclaimed, WORKERS * (ROUNDS - 1));

    collected.wait();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(manager.registered_threads(), vec![gc.key()]);
}
