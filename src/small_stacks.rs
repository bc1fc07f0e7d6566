//! Exact-size free stacks over a shared node arena
//!
//! One lock-free stack per exact size class in `[small_min, small_max)`.
//! A freed run this small can be shorter than a pointer, so the linking
//! lives in external nodes drawn from one pre-allocated arena shared by
//! every class. Stack heads and the arena free list pack a generation
//! counter next to the node index so a stale head snapshot can never win
//! its compare-exchange (ABA prevention).

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::error::PoolError;

/// Sentinel index marking an empty list
const NIL: u32 = u32::MAX;

// Pack a 32-bit generation counter and a 32-bit node index into a usize
#[cfg(target_pointer_width = "64")]
const TAG_BITS: usize = 32;
#[cfg(target_pointer_width = "64")]
const INDEX_MASK: usize = 0xFFFF_FFFF;

#[inline(always)]
#[cfg(target_pointer_width = "64")]
fn pack_tagged(generation: u32, index: u32) -> usize {
    ((generation as usize) << TAG_BITS) | (index as usize)
}

#[inline(always)]
#[cfg(target_pointer_width = "64")]
fn unpack_generation(tagged: usize) -> u32 {
    (tagged >> TAG_BITS) as u32
}

#[inline(always)]
#[cfg(target_pointer_width = "64")]
fn unpack_index(tagged: usize) -> u32 {
    (tagged & INDEX_MASK) as u32
}

// 32-bit fallback - no generation tagging
#[cfg(not(target_pointer_width = "64"))]
#[inline(always)]
fn pack_tagged(_generation: u32, index: u32) -> usize {
    index as usize
}

#[cfg(not(target_pointer_width = "64"))]
#[inline(always)]
fn unpack_generation(_tagged: usize) -> u32 {
    0
}

#[cfg(not(target_pointer_width = "64"))]
#[inline(always)]
fn unpack_index(tagged: usize) -> u32 {
    tagged as u32
}

/// Linking node for one freed run
struct Node {
    /// The freed run; meaningful only while the node sits on a class list
    value: UnsafeCell<*mut u8>,
    /// Index of the next node on whichever list this node is on
    next: AtomicU32,
}

/// Fixed-capacity slab of linking nodes shared by all size classes
///
/// Nodes circulate between the internal free list and the class lists;
/// nothing is allocated after construction.
struct NodeArena {
    nodes: Box<[Node]>,
    /// Free-node list head (tagged generation + index)
    free: CachePadded<AtomicUsize>,
}

impl NodeArena {
    fn new(capacity: usize) -> Self {
        let nodes: Box<[Node]> = (0..capacity)
            .map(|i| Node {
                value: UnsafeCell::new(std::ptr::null_mut()),
                next: AtomicU32::new(if i + 1 < capacity { (i + 1) as u32 } else { NIL }),
            })
            .collect();
        let head = if capacity > 0 { 0 } else { NIL };
        Self {
            nodes,
            free: CachePadded::new(AtomicUsize::new(pack_tagged(0, head))),
        }
    }

    /// Claim a free node, or `None` when the arena is exhausted
    fn acquire(&self) -> Option<u32> {
        loop {
            let head = self.free.load(Ordering::Acquire);
            let index = unpack_index(head);
            if index == NIL {
                return None;
            }
            let next = self.nodes[index as usize].next.load(Ordering::Acquire);
            let claimed = pack_tagged(unpack_generation(head).wrapping_add(1), next);
            if self
                .free
                .compare_exchange_weak(head, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    /// Return a node to the free list
    fn release(&self, index: u32) {
        let node = &self.nodes[index as usize];
        loop {
            let head = self.free.load(Ordering::Acquire);
            node.next.store(unpack_index(head), Ordering::Relaxed);
            let tagged = pack_tagged(unpack_generation(head).wrapping_add(1), index);
            if self
                .free
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// One lock-free stack per exact small size class
pub(crate) struct SmallStacks {
    /// Class list heads (tagged generation + index), one per exact size
    heads: Box<[CachePadded<AtomicUsize>]>,
    arena: NodeArena,
    small_min: usize,
}

// Safety: a node is only written between claiming it from the arena and
// publishing it on a class list, or read after winning the pop CAS; both
// windows are exclusive to one thread.
unsafe impl Send for SmallStacks {}
unsafe impl Sync for SmallStacks {}

impl SmallStacks {
    pub(crate) fn new(small_min: usize, classes: usize, node_capacity: usize) -> Self {
        let heads = (0..classes)
            .map(|_| CachePadded::new(AtomicUsize::new(pack_tagged(0, NIL))))
            .collect();
        Self {
            heads,
            arena: NodeArena::new(node_capacity),
            small_min,
        }
    }

    /// Push a freed run of exactly `size` bytes onto its class stack
    ///
    /// Fails when the node arena is exhausted; the run is then simply
    /// not recycled.
    pub(crate) fn push(&self, size: usize, run: *mut u8) -> Result<(), PoolError> {
        let Some(index) = self.arena.acquire() else {
            return Err(PoolError::ReleaseFailed);
        };
        let node = &self.arena.nodes[index as usize];
        // Safety: the node is exclusively ours until the CAS below lands
        unsafe { *node.value.get() = run };
        let head_slot = &self.heads[size - self.small_min];
        loop {
            let head = head_slot.load(Ordering::Acquire);
            node.next.store(unpack_index(head), Ordering::Relaxed);
            let tagged = pack_tagged(unpack_generation(head).wrapping_add(1), index);
            if head_slot
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Pop a recycled run from the smallest class that can hold `size`
    pub(crate) fn pop_at_least(&self, size: usize) -> Option<NonNull<u8>> {
        for class in (size - self.small_min)..self.heads.len() {
            if let Some(run) = self.pop_class(class) {
                return Some(run);
            }
        }
        None
    }

    fn pop_class(&self, class: usize) -> Option<NonNull<u8>> {
        let head_slot = &self.heads[class];
        loop {
            let head = head_slot.load(Ordering::Acquire);
            let index = unpack_index(head);
            if index == NIL {
                return None;
            }
            let node = &self.arena.nodes[index as usize];
            let next = node.next.load(Ordering::Acquire);
            let tagged = pack_tagged(unpack_generation(head).wrapping_add(1), next);
            if head_slot
                .compare_exchange_weak(head, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Safety: the winning CAS took the node off the list
                let run = unsafe { *node.value.get() };
                self.arena.release(index);
                return NonNull::new(run);
            }
        }
    }
}
