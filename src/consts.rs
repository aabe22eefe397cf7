// Compile-time constants used throughout the crate, collected in one place
// for easy modification. Every process attaching to the same pool must be
// built with the same values.

/// Name of the shared memory region, as passed to `shm_open`.
pub const SHM_NAME: &str = "/shmq_core";

/// Allocation granularity of the pool, in bytes. Should divide the page
/// size evenly to keep overhead and wasted space balanced.
pub const BLOCK_SIZE: usize = 128;

/// Size of the pool data region requested at creation, in bytes. A mismatch
/// between processes leaves later attachers with a short mapping, which is
/// undefined behavior; keep this a compile-time constant.
pub const POOL_SIZE: usize = 64000;

/// Default number of items a ring can hold. Must be a power of two.
pub const QUEUE_CAPACITY: u32 = 1 << 6;

/// Maximum number of consumers a fan-out queue can have.
pub const MAX_CONSUMERS: usize = 64;

/// Pool offset of the hashmap that maps queue names to queue offsets.
pub const NAME_MAP_OFFSET: u32 = 0;

/// Number of buckets in the queue-name hashmap.
pub const NAME_MAP_BUCKETS: usize = 128;
