//! Concurrent string pool allocator
//!
//! A thread-safe pool that hands out short-lived, variable-length byte
//! runs (NUL-terminated strings and raw byte buffers) far faster than a
//! general-purpose allocator. Built for workloads that produce millions
//! of small strings on many threads: tokenizers, interners, parsers,
//! log aggregators.
//!
//! ## Core Design
//!
//! 1. **Lock-free bump allocation**: threads race to claim disjoint
//!    sub-ranges of the current cache-aligned backing block via a single
//!    fetch-and-add; exactly one thread is elected to install a fresh
//!    block when the current one is exhausted.
//! 2. **Exact-size recycling**: freed runs below `small_max` go to one
//!    lock-free stack per exact size, backed by a shared node arena.
//! 3. **Power-of-two recycling**: larger freed runs store a forwarding
//!    pointer in their own first bytes and go to one version-tagged
//!    stack per power-of-two size class, with ABA-safe pop/push.
//!
//! Requests at or above the block size bypass the pool and hit the
//! system allocator directly. Blocks are only reclaimed when the pool
//! is dropped; there is no defragmentation.
//!
//! ## Example
//!
//! ```
//! use charpool::CharPool;
//!
//! let pool = CharPool::new()?;
//! let run = pool.copy(b"tokenized")?;
//! // ... use the NUL-terminated run ...
//! unsafe { pool.release(run, b"tokenized".len() + 1)? };
//! # Ok::<(), charpool::PoolError>(())
//! ```

#![warn(missing_docs)]
#![allow(unsafe_code)] // Freed runs are reinterpreted as free-list nodes

pub mod config;
pub mod error;
pub mod pool;

mod block;
mod large_lists;
mod small_stacks;

pub use crate::config::PoolConfig;
pub use crate::error::PoolError;
pub use crate::pool::{CharPool, PoolStats};

/// Alignment of block buffers and oversize runs (bytes)
pub const CACHE_LINE_SIZE: usize = 64;
