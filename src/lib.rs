//! Shared-memory message passing for sibling processes on one host.
//!
//! Everything lives in a single named, memory-mapped pool. Producers
//! publish trivially copyable records into a fan-out [`Queue`]; every
//! registered consumer receives every record in the order its producer
//! emitted it. The non-blocking paths are lock-free and never enter the
//! kernel; the blocking paths park on futexes embedded in the shared
//! structures, so they work across processes as well as threads.
//!
//! The layers, bottom up:
//! - [`Pool`]: the mapped region plus a block-bitmap allocator. All
//!   cross-process references are pool-relative byte offsets.
//! - [`MpscRing`]: a bounded power-of-two ring supporting multi-producer
//!   reservation-based writes and single-consumer reads.
//! - [`Queue`]: one ring per consumer handle behind a single enqueue
//!   that commits to every live ring or to none.
//!
//! Queues are discovered by name: [`Queue::fetch`] consults a shared
//! hashmap at a well-known pool offset and creates the queue on first
//! use.
//!
//! Payload types must be trivially copyable (`Copy`). A payload that
//! contains a pointer is only meaningful to the receiving process if
//! that pointer is itself a pool offset.

pub mod consts;
mod error;
pub mod map;
pub mod pool;
pub mod queue;
pub mod ring;
pub mod sync;

pub use error::{Error, Result};
pub use map::{MapKey, SharedHashmap};
pub use pool::Pool;
pub use queue::Queue;
pub use ring::MpscRing;

/// The contract of a fan-out queue handle.
///
/// Handles are single-threaded views onto shared queue state: `&mut self`
/// everywhere, one handle per thread. Only handles created as consumers
/// may call the dequeue and peek methods.
pub trait MessageQueue<T: Copy + Send> {
    /// Adds an element for every live consumer, or for none. False means
    /// some ring was full, or nobody is listening.
    fn enqueue(&mut self, item: T) -> bool;

    /// Adds an element for every live consumer, parking at full rings.
    /// False means nobody is listening.
    fn enqueue_blocking(&mut self, item: T) -> bool;

    /// Removes the next element, or `None` when the queue is empty.
    fn dequeue_next(&mut self) -> Option<T>;

    /// Removes the next element, parking until one arrives.
    fn dequeue_next_blocking(&mut self) -> T;

    /// Copies the next element without removing it.
    fn peek_next(&mut self) -> Option<T>;

    /// Copies the next element without removing it, parking until one
    /// arrives.
    fn peek_next_blocking(&mut self) -> T;

    /// Number of consumers currently registered.
    fn num_consumers(&self) -> u32;

    /// Pool offset of the shared queue state.
    fn offset(&self) -> u32;
}
