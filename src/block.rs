//! Backing blocks for bump allocation
//!
//! Each block owns one cache-line aligned buffer plus an atomic fill
//! index. Blocks are chained through raw `next` pointers into a
//! singly-linked stack; only the chain head receives new allocations,
//! and the chain is walked single-threaded when the pool drops.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;

use crate::CACHE_LINE_SIZE;
use crate::error::PoolError;

/// One backing block: an aligned buffer and its bump cursor
pub(crate) struct Block {
    data: NonNull<u8>,
    layout: Layout,
    /// Bump cursor; monotonically non-decreasing while this block is the
    /// chain head, frozen afterwards
    pub(crate) fill: AtomicUsize,
    /// Previous chain head; owned by the pool, walked at drop
    pub(crate) next: *mut Block,
}

impl Block {
    /// Allocate a block with a `capacity`-byte aligned buffer
    ///
    /// `initial_fill` lets the thread installing the block claim its
    /// prefix before the block becomes visible to other threads. The
    /// caller owns the returned pointer until it is linked into a chain.
    pub(crate) fn new(capacity: usize, initial_fill: usize) -> Result<NonNull<Block>, PoolError> {
        let layout = Layout::from_size_align(capacity, CACHE_LINE_SIZE)
            .map_err(|_| PoolError::OutOfMemory)?;
        let data = unsafe { alloc(layout) };
        let Some(data) = NonNull::new(data) else {
            return Err(PoolError::OutOfMemory);
        };
        let block = Box::new(Block {
            data,
            layout,
            fill: AtomicUsize::new(initial_fill),
            next: std::ptr::null_mut(),
        });
        // Safety: Box::into_raw never returns null
        Ok(unsafe { NonNull::new_unchecked(Box::into_raw(block)) })
    }

    /// Pointer `offset` bytes into the buffer
    ///
    /// The caller guarantees `offset` lies within the buffer.
    #[inline]
    pub(crate) fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.layout.size());
        // Safety: in-bounds offset from a non-null buffer
        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(offset)) }
    }

    /// Base of the buffer
    #[inline]
    pub(crate) fn data(&self) -> NonNull<u8> {
        self.data
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // Safety: `data` was allocated with exactly this layout
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}
