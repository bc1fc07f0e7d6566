//! Pool front-end: request dispatch, block growth, lifecycle
//!
//! An allocation is tried against the free lists first, then bump-claimed
//! from the head block with a single fetch-and-add. When the head is
//! exhausted, one thread is elected through a non-blocking lock to
//! install a fresh block while the rest spin on a CPU relax hint, bounded
//! so pathological contention surfaces as a soft failure instead of a
//! hang.

use std::alloc::{Layout, alloc, dealloc};
use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::CACHE_LINE_SIZE;
use crate::block::Block;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::large_lists::LargeLists;
use crate::small_stacks::SmallStacks;

/// Iterations of the CPU relax hint a thread may wait for a fresh head
/// block before its allocation fails
const GROW_SPIN_LIMIT: usize = 1000;

/// Concurrent pool of short-lived byte runs
///
/// Shared by reference across threads; every operation takes `&self`.
/// Runs handed out stay valid until they are released or the pool is
/// dropped, whichever comes first. Dropping the pool invalidates all
/// outstanding runs.
pub struct CharPool {
    config: PoolConfig,
    small: SmallStacks,
    large: LargeLists,
    /// Current allocation frontier; replaced only by an elected leader
    head: AtomicPtr<Block>,
    /// Serializes the decision to install a new head block; contended
    /// threads never block on it, they spin and re-check the head
    grow_lock: Mutex<()>,
    blocks: AtomicUsize,
    oversize_allocs: AtomicUsize,
}

// Safety: all shared state is atomic or internally synchronized, and
// handed-out runs are disjoint sub-ranges owned by their callers.
unsafe impl Send for CharPool {}
unsafe impl Sync for CharPool {}

impl CharPool {
    /// Create a pool with the default configuration
    pub fn new() -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with a validated configuration
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is rejected, `OutOfMemory`
    /// if the first backing block cannot be allocated.
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let small = SmallStacks::new(config.small_min, config.small_classes(), config.node_capacity);
        let large = LargeLists::new(config.num_large_lists(), config.small_level_threshold());
        let block = Block::new(config.block_size, 0)?;
        let pool = Self {
            small,
            large,
            head: AtomicPtr::new(block.as_ptr()),
            grow_lock: Mutex::new(()),
            blocks: AtomicUsize::new(1),
            oversize_allocs: AtomicUsize::new(0),
            config,
        };
        debug!(
            small_min = config.small_min,
            small_max = config.small_max,
            block_size = config.block_size,
            "string pool created"
        );
        Ok(pool)
    }

    /// Allocate `size` writable bytes
    ///
    /// The returned bytes are uninitialized. Recycled runs may be larger
    /// than requested; only `size` bytes are the caller's to use.
    ///
    /// # Errors
    ///
    /// `InvalidSize` if `size` is below the configured minimum,
    /// `OutOfMemory` if the system allocator fails or no fresh backing
    /// block could be installed within the spin budget.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        if size < self.config.small_min {
            return Err(PoolError::InvalidSize {
                size,
                min: self.config.small_min,
            });
        }
        // Requests of a whole block or more bypass the pool entirely
        if size >= self.config.block_size {
            return self.alloc_oversize(size);
        }
        if size < self.config.small_max {
            if let Some(run) = self.small.pop_at_least(size) {
                return Ok(run);
            }
        } else if let Some(run) = self.large.pop(size) {
            return Ok(run);
        }
        self.bump_alloc(size)
    }

    /// Return a run to the pool for reuse
    ///
    /// Small runs go back to their exact-size stack, larger runs to the
    /// power-of-two list for their size, and block-sized runs straight
    /// to the system allocator.
    ///
    /// # Safety
    ///
    /// `run` must have been returned by this pool with the same `size`
    /// and must not be used, released again, or reachable from any other
    /// thread after this call.
    ///
    /// # Errors
    ///
    /// `InvalidSize` if `size` is below the configured minimum,
    /// `ReleaseFailed` if the free-stack node arena is exhausted (the
    /// run's bytes then stay in their block until the pool drops; no
    /// invariant is violated).
    pub unsafe fn release(&self, run: NonNull<u8>, size: usize) -> Result<(), PoolError> {
        unsafe { self.release_run(run, size) }
    }

    /// Copy `bytes` into a freshly allocated, NUL-terminated run
    ///
    /// The run is `bytes.len() + 1` bytes long; release it with that
    /// size. Empty input is rejected.
    ///
    /// # Errors
    ///
    /// As [`alloc`](Self::alloc) with `bytes.len() + 1`.
    pub fn copy(&self, bytes: &[u8]) -> Result<NonNull<u8>, PoolError> {
        if bytes.is_empty() {
            return Err(PoolError::InvalidSize {
                size: 0,
                min: self.config.small_min,
            });
        }
        let run = self.alloc(bytes.len() + 1)?;
        // Safety: the run has `bytes.len() + 1` writable bytes and cannot
        // overlap the borrowed input
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), run.as_ptr(), bytes.len());
            run.as_ptr().add(bytes.len()).write(0);
        }
        Ok(run)
    }

    /// Copy a C string, terminator included, into the pool
    ///
    /// # Errors
    ///
    /// As [`copy`](Self::copy) of the string's bytes.
    pub fn copy_cstr(&self, s: &CStr) -> Result<NonNull<u8>, PoolError> {
        self.copy(s.to_bytes())
    }

    /// The validated configuration this pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Point-in-time usage counters
    pub fn stats(&self) -> PoolStats {
        let head = self.head.load(Ordering::Acquire);
        // Safety: the head block lives as long as the pool
        let fill = unsafe { (*head).fill.load(Ordering::Relaxed) };
        let blocks = self.blocks.load(Ordering::Relaxed);
        PoolStats {
            blocks,
            reserved_bytes: blocks * self.config.block_size,
            head_fill: fill.min(self.config.block_size),
            oversize_allocs: self.oversize_allocs.load(Ordering::Relaxed),
        }
    }

    /// Claim `size` bytes from the head block, growing the chain when
    /// the head is exhausted
    fn bump_alloc(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let block_size = self.config.block_size;
        // Head this thread has already overflowed; don't re-claim on it
        let mut exhausted: *mut Block = ptr::null_mut();
        let mut spins = 0usize;
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head != exhausted {
                // Safety: blocks are never freed before the pool drops
                let block = unsafe { &*head };
                let offset = block.fill.fetch_add(size, Ordering::AcqRel);
                if offset + size <= block_size {
                    return Ok(block.at(offset));
                }
                // This request retires the head for this thread. The one
                // thread whose claim crossed the boundary still owns the
                // tail and recycles it, once, before waiting.
                let tail = block_size.saturating_sub(offset);
                if tail >= self.config.small_min {
                    // Safety: `[offset, block_size)` was claimed by this
                    // thread's fetch-and-add and is never handed out
                    if let Err(err) = unsafe { self.release_run(block.at(offset), tail) } {
                        warn!(%err, tail, "block tail not recycled, reclaimed at drop");
                    }
                }
                exhausted = head;
            }
            if let Some(_guard) = self.grow_lock.try_lock() {
                // Leader: someone may have grown the chain while we raced
                // for the lock; if so, retry against the new head
                let current = self.head.load(Ordering::Acquire);
                if current != exhausted {
                    continue;
                }
                let fresh = Block::new(block_size, size)?;
                // Safety: the fresh block is invisible to other threads
                // until the store below publishes it
                unsafe { (*fresh.as_ptr()).next = current };
                self.head.store(fresh.as_ptr(), Ordering::Release);
                let blocks = self.blocks.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(blocks, "installed fresh backing block");
                // The prefix `[0, size)` was claimed at construction
                return Ok(unsafe { (*fresh.as_ptr()).data() });
            }
            if spins >= GROW_SPIN_LIMIT {
                warn!(spins, "no fresh block within spin budget");
                return Err(PoolError::OutOfMemory);
            }
            spins += 1;
            std::hint::spin_loop();
        }
    }

    /// Route a freed run to the matching free list
    ///
    /// # Safety
    ///
    /// As [`release`](Self::release).
    unsafe fn release_run(&self, run: NonNull<u8>, size: usize) -> Result<(), PoolError> {
        if size < self.config.small_min {
            return Err(PoolError::InvalidSize {
                size,
                min: self.config.small_min,
            });
        }
        if size < self.config.small_max {
            return self.small.push(size, run.as_ptr());
        }
        if size >= self.config.block_size {
            // Safety: oversize runs were allocated with exactly this layout
            unsafe { dealloc(run.as_ptr(), oversize_layout(size)?) };
            return Ok(());
        }
        self.large.push(size, run);
        Ok(())
    }

    fn alloc_oversize(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let layout = oversize_layout(size)?;
        // Safety: layout has nonzero size (at least `block_size`)
        let run = unsafe { alloc(layout) };
        let Some(run) = NonNull::new(run) else {
            return Err(PoolError::OutOfMemory);
        };
        self.oversize_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(run)
    }
}

impl Drop for CharPool {
    fn drop(&mut self) {
        // Runs still held by callers die with their blocks; the free
        // lists hold only pointers into blocks and need no walking
        let mut block = *self.head.get_mut();
        while !block.is_null() {
            // Safety: chain nodes were created by Box::into_raw and are
            // owned exclusively by the pool
            let owned = unsafe { Box::from_raw(block) };
            block = owned.next;
        }
    }
}

fn oversize_layout(size: usize) -> Result<Layout, PoolError> {
    Layout::from_size_align(size, CACHE_LINE_SIZE).map_err(|_| PoolError::OutOfMemory)
}

/// Point-in-time pool usage counters
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Backing blocks currently chained
    pub blocks: usize,
    /// Total bytes reserved in backing blocks
    pub reserved_bytes: usize,
    /// Bytes consumed from the current head block
    pub head_fill: usize,
    /// Allocations that bypassed the pool because they reached the
    /// block size
    pub oversize_allocs: usize,
}
