// A low-level mutex built on one futex word. It must be placed in shared
// memory by whatever uses it; because the pool is a shared mapping, the
// kernel gives us process-shared futex semantics for free.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::sync::futex;

const FREE: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

/// A three-state futex mutex: 0 free, 1 held, 2 held with (probable)
/// waiters. Uncontended acquire and release stay entirely in user space.
#[repr(C)]
pub struct Mutex {
    state: AtomicU32,
}

impl Mutex {
    /// Initializes a mutex in place. `mutex` must point to writable memory
    /// that nobody is concurrently using as a mutex.
    pub unsafe fn init_in_place(mutex: *mut Mutex) {
        ptr::addr_of_mut!((*mutex).state).write(AtomicU32::new(FREE));
    }

    /// Acquires the mutex, blocking if it is already held. Returns a guard
    /// that releases it on drop.
    pub fn lock(&self) -> MutexGuard<'_> {
        if self
            .state
            .compare_exchange(FREE, HELD, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Contended. Advertise a waiter by moving the state to 2 before
            // parking; parking on 1 would lose wake-ups.
            loop {
                if self.state.load(Ordering::SeqCst) == CONTENDED
                    || self
                        .state
                        .compare_exchange(HELD, CONTENDED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    futex::wait(&self.state, CONTENDED);
                }

                if self
                    .state
                    .compare_exchange(FREE, CONTENDED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    // A releasing thread set the state to 0 and we grabbed
                    // it before anyone else.
                    break;
                }
            }
        }

        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        // If the lock is uncontended, this single CAS releases it.
        if self
            .state
            .compare_exchange(HELD, FREE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // The state only goes up while the lock is held, so it must be
            // 2 now and somebody may be parked.
            let released = self
                .state
                .compare_exchange(CONTENDED, FREE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            assert!(released, "releasing a mutex that is not held");

            futex::wake(&self.state, 1);
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }
}

/// Releases the mutex when dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
