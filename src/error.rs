//! Pool error types

use thiserror::Error;

/// Errors surfaced by the string pool
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Configuration rejected at construction
    #[error("invalid pool configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected
        reason: &'static str,
    },

    /// Requested or released size is below the configured minimum
    #[error("size {size} is below the pool minimum {min}")]
    InvalidSize {
        /// The rejected size
        size: usize,
        /// The configured minimum run size
        min: usize,
    },

    /// A system allocation failed, or no fresh backing block could be
    /// installed within the spin budget (the caller may retry)
    #[error("out of memory")]
    OutOfMemory,

    /// The freed run was not recycled because the free-stack node arena
    /// is exhausted; its bytes stay in their block until the pool drops
    #[error("release failed: free-stack node arena exhausted")]
    ReleaseFailed,
}
