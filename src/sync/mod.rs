//! Futex-based synchronization primitives that work across processes when
//! placed in a shared mapping.

pub mod futex;
mod mutex;

pub use mutex::{Mutex, MutexGuard};
