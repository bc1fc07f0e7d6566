//! Concurrent stress tests
//!
//! Production-shaped load: many threads allocating small runs, releasing
//! a fraction back, finishing with a block-sized run each; plus tight
//! recycle churn on a single power-of-two list to shake out ABA bugs and
//! mixed-size churn across the exact-size stacks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use charpool::{CharPool, PoolConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_THREADS: usize = 8;
const NUM_INSERTS: usize = 2560;

#[test]
fn stress_mixed_alloc_release() {
    let pool = Arc::new(CharPool::new().expect("pool"));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for _ in 0..NUM_THREADS {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let n = 10usize;
            let mut prev = None;
            for i in 0..NUM_INSERTS {
                let run = pool.alloc(n).expect("alloc");
                unsafe {
                    for j in 0..n - 1 {
                        run.as_ptr().add(j).write(b'a' + ((i + j) % 26) as u8);
                    }
                    run.as_ptr().add(n - 1).write(0);
                    for j in 0..n - 1 {
                        assert_eq!(run.as_ptr().add(j).read(), b'a' + ((i + j) % 26) as u8);
                    }
                }
                if i % 10 == 9 {
                    if let Some(stale) = prev.take() {
                        unsafe { pool.release(stale, n).expect("release") };
                    }
                }
                prev = Some(run);
            }

            // Block-sized finale goes straight to the system allocator
            let block_size = pool.config().block_size;
            let big = pool.alloc(block_size).expect("oversize alloc");
            unsafe {
                for j in 0..block_size {
                    big.as_ptr().add(j).write((j % 251) as u8);
                }
                for j in (0..block_size).step_by(509) {
                    assert_eq!(big.as_ptr().add(j).read(), (j % 251) as u8);
                }
                pool.release(big, block_size).expect("oversize release");
            }
        }));
    }

    for handle in handles {
        handle.join().expect("worker");
    }
    assert!(pool.stats().blocks >= 1);
}

#[test]
fn recycle_churn_never_aliases_runs() {
    // floor == ceil for a power-of-two size, so every release feeds the
    // list the next alloc probes first; the list head cycles through the
    // same few runs from all threads at once
    const SIZE: usize = 128;
    const THREADS: usize = 4;
    const ROUNDS: usize = 20_000;

    let pool = Arc::new(
        CharPool::with_config(PoolConfig {
            small_min: 1,
            small_max: 8,
            block_size: 1024,
            ..PoolConfig::default()
        })
        .expect("pool"),
    );
    let barrier = Arc::new(Barrier::new(THREADS));
    let mut handles = Vec::new();

    for t in 0..THREADS {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let fill = 0x10 + t as u8;
            barrier.wait();
            for _ in 0..ROUNDS {
                let run = pool.alloc(SIZE).expect("alloc");
                unsafe {
                    run.as_ptr().write_bytes(fill, SIZE);
                    // Another thread holding the same run would have
                    // overwritten our pattern by now
                    for j in [0, SIZE / 2, SIZE - 1] {
                        assert_eq!(run.as_ptr().add(j).read(), fill);
                    }
                    pool.release(run, SIZE).expect("release");
                }
            }
        }));
    }

    for handle in handles {
        handle.join().expect("worker");
    }
}

#[test]
fn small_classes_recycle_across_threads() {
    const THREADS: usize = 4;
    const OPS: usize = 10_000;

    let pool = Arc::new(
        CharPool::with_config(PoolConfig {
            node_capacity: 1 << 16,
            ..PoolConfig::default()
        })
        .expect("pool"),
    );
    let recycled = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for t in 0..THREADS {
        let pool = Arc::clone(&pool);
        let recycled = Arc::clone(&recycled);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(t as u64);
            let mut held = Vec::new();
            for _ in 0..OPS {
                if !held.is_empty() && rng.gen_bool(0.5) {
                    let (run, size): (std::ptr::NonNull<u8>, usize) =
                        held.swap_remove(rng.gen_range(0..held.len()));
                    unsafe { pool.release(run, size).expect("release") };
                    recycled.fetch_add(1, Ordering::Relaxed);
                } else {
                    let size = rng.gen_range(1..8);
                    let run = pool.alloc(size).expect("alloc");
                    unsafe { run.as_ptr().write_bytes(t as u8, size) };
                    held.push((run, size));
                }
            }
            for (run, size) in held {
                unsafe { pool.release(run, size).expect("release") };
            }
        }));
    }

    for handle in handles {
        handle.join().expect("worker");
    }
    assert!(recycled.load(Ordering::Relaxed) > 0);
}
