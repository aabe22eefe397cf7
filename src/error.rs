use thiserror::Error;

/// Result type alias for fallible construction paths.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the construction-time APIs. Fast-path operations
/// (reserve, enqueue, dequeue) report contention losses through their
/// return values instead; invariant violations are fatal assertions.
#[derive(Error, Debug)]
pub enum Error {
    /// The pool has no free run of blocks large enough for the request.
    #[error("shared memory pool exhausted")]
    PoolExhausted,

    /// Ring capacities must be a power of two so indices can wrap with a
    /// bitmask.
    #[error("ring capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(u32),

    /// Mapping the shared memory region failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] std::io::Error),
}
