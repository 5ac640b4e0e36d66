//! A process-wide `SegregatedAllocator` shared between threads.

use allocator_api2::alloc::Global;
use segalloc::{size_class_bytes, SegregatedAllocator, SpinLock, MAX_BYTES, NUM_SIZE_CLASSES};
use std::{collections::BTreeSet, ptr::NonNull, thread};

static ALLOCATOR: SegregatedAllocator<Global, SpinLock> =
    SegregatedAllocator::new(Global, SpinLock::new());

const THREADS: usize = 8;
const ROUNDS: usize = 200;
const BLOCKS_PER_ROUND: usize = 64;

#[test]
fn shared_allocator_is_sync() {
    fn assert_sync<T: Sync>() {}
    assert_sync::<SegregatedAllocator<Global, SpinLock>>();
}

#[test]
fn concurrent_allocations_never_alias() {
    let _ = env_logger::try_init();

    thread::scope(|scope| {
        for t in 0..THREADS {
            scope.spawn(move || {
                let pattern = 0x10 + t as u8;
                for round in 0..ROUNDS {
                    let blocks: Vec<(NonNull<u8>, usize)> = (0..BLOCKS_PER_ROUND)
                        .map(|i| {
                            // Mostly small sizes, with the odd one over the
                            // ceiling.
                            let bytes = (t * 7 + round * 3 + i * 5) % (MAX_BYTES + 40);
                            let ptr = ALLOCATOR.allocate_bytes(bytes).unwrap();
                            unsafe { ptr.write_bytes(pattern, bytes) };
                            (ptr, bytes)
                        })
                        .collect();

                    let distinct: BTreeSet<usize> =
                        blocks.iter().map(|(ptr, _)| ptr.as_ptr() as usize).collect();
                    assert_eq!(distinct.len(), blocks.len());

                    for (ptr, bytes) in blocks {
                        let contents = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), bytes) };
                        assert!(
                            contents.iter().all(|b| *b == pattern),
                            "thread {t}: block {ptr:p} was written by another thread"
                        );
                        unsafe { ALLOCATOR.deallocate_bytes(ptr, bytes) };
                    }
                }
            });
        }
    });

    // Every small block handed out above has come back, so the idle blocks
    // and the arena account for every arena byte ever obtained.
    let heap_size = ALLOCATOR.heap_size();
    let idle_bytes: usize = (0..NUM_SIZE_CLASSES)
        .map(|class| ALLOCATOR.free_blocks(class) * size_class_bytes(class))
        .sum();
    assert_eq!(idle_bytes + ALLOCATOR.arena_len(), heap_size);

    // And each size class can hand all of its idle blocks out again without
    // growing the arena.
    for class in 0..NUM_SIZE_CLASSES {
        let bytes = size_class_bytes(class);
        let idle = ALLOCATOR.free_blocks(class);
        let blocks: Vec<_> = (0..idle)
            .map(|_| ALLOCATOR.allocate_bytes(bytes).unwrap())
            .collect();
        assert_eq!(ALLOCATOR.free_blocks(class), 0);
        for ptr in blocks {
            unsafe { ALLOCATOR.deallocate_bytes(ptr, bytes) };
        }
        assert_eq!(ALLOCATOR.free_blocks(class), idle);
    }
    assert_eq!(ALLOCATOR.heap_size(), heap_size);
}
