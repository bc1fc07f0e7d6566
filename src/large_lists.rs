//! Power-of-two free lists for runs between `small_max` and `block_size`
//!
//! A freed run this large can hold a forwarding pointer in its own first
//! bytes, so the list nodes are the runs themselves and nothing is
//! allocated on push. List `k` holds runs of at least
//! `2^(k + small_level_threshold)` bytes: releases land on the floor
//! level of their size, pops probe from the ceiling level upward, so a
//! popped run is always large enough for the request.
//!
//! Each head packs a version counter next to the run address. Pushes
//! increment the version, pops carry it through; a pop's stale snapshot
//! therefore loses its compare-exchange even when the same run cycles
//! back to the head (ABA prevention). One version bump per cycle is
//! enough because a run can only reappear at the head via a push.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

// Pack a 16-bit version counter above a 48-bit run address
#[cfg(target_pointer_width = "64")]
const ADDR_BITS: usize = 48;
#[cfg(target_pointer_width = "64")]
const ADDR_MASK: usize = (1 << ADDR_BITS) - 1;
#[cfg(target_pointer_width = "64")]
const VERSION_MASK: usize = (1 << (usize::BITS as usize - ADDR_BITS)) - 1;

#[inline(always)]
#[cfg(target_pointer_width = "64")]
fn pack_versioned(version: usize, run: *mut u8) -> usize {
    debug_assert_eq!(run as usize & !ADDR_MASK, 0, "run address exceeds 48 bits");
    ((version & VERSION_MASK) << ADDR_BITS) | (run as usize)
}

#[inline(always)]
#[cfg(target_pointer_width = "64")]
fn unpack_version(head: usize) -> usize {
    head >> ADDR_BITS
}

#[inline(always)]
#[cfg(target_pointer_width = "64")]
fn unpack_run(head: usize) -> *mut u8 {
    (head & ADDR_MASK) as *mut u8
}

// 32-bit fallback - the whole word is the address and no version is kept
#[cfg(not(target_pointer_width = "64"))]
#[inline(always)]
fn pack_versioned(_version: usize, run: *mut u8) -> usize {
    run as usize
}

#[cfg(not(target_pointer_width = "64"))]
#[inline(always)]
fn unpack_version(_head: usize) -> usize {
    0
}

#[cfg(not(target_pointer_width = "64"))]
#[inline(always)]
fn unpack_run(head: usize) -> *mut u8 {
    head as *mut u8
}

#[inline(always)]
fn floor_log2(n: usize) -> u32 {
    n.ilog2()
}

#[inline(always)]
fn ceil_log2(n: usize) -> u32 {
    if n.is_power_of_two() { n.ilog2() } else { n.ilog2() + 1 }
}

/// Version-tagged free lists, one per power-of-two size level
pub(crate) struct LargeLists {
    heads: Box<[CachePadded<AtomicUsize>]>,
    /// floor(log2(small_max)); list `k` serves level `k + threshold`
    threshold: u32,
}

impl LargeLists {
    pub(crate) fn new(num_lists: usize, threshold: u32) -> Self {
        let heads = (0..num_lists)
            .map(|_| CachePadded::new(AtomicUsize::new(pack_versioned(0, std::ptr::null_mut()))))
            .collect();
        Self { heads, threshold }
    }

    /// Push a freed run of `size` bytes onto the list for its floor level
    pub(crate) fn push(&self, size: usize, run: NonNull<u8>) {
        let list = (floor_log2(size) - self.threshold) as usize;
        let head_slot = &self.heads[list];
        let run = run.as_ptr();
        loop {
            let head = head_slot.load(Ordering::Acquire);
            // The forwarding pointer lives in the run's first bytes; runs
            // from the bump path can sit at any byte offset, so the write
            // is unaligned
            unsafe { run.cast::<*mut u8>().write_unaligned(unpack_run(head)) };
            let tagged = pack_versioned(unpack_version(head).wrapping_add(1), run);
            if head_slot
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop a run of at least `size` bytes, probing each list from the
    /// ceiling level upward once
    pub(crate) fn pop(&self, size: usize) -> Option<NonNull<u8>> {
        let first = (ceil_log2(size) - self.threshold) as usize;
        for head_slot in self.heads.iter().skip(first) {
            loop {
                let head = head_slot.load(Ordering::Acquire);
                let run = unpack_run(head);
                if run.is_null() {
                    break;
                }
                // The run stays mapped for the pool's whole lifetime. If
                // another thread already owns it, this read may tear, but
                // the version mismatch then fails the CAS and the value
                // is discarded.
                let next = unsafe { run.cast::<*mut u8>().read_unaligned() };
                let tagged = pack_versioned(unpack_version(head), next);
                if head_slot
                    .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return NonNull::new(run);
                }
            }
        }
        None
    }
}
