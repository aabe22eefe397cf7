//! The single-consumer ring: a bounded, power-of-two queue living in the
//! pool, written by any number of producers through an atomic reservation
//! protocol and drained by exactly one consumer.
//!
//! This type is a building block for the fan-out [`Queue`](crate::Queue)
//! and is rarely what an application wants directly, because it supports
//! only one consumer per ring. The non-blocking operations are lock-free
//! and never enter the kernel; the blocking variants park on futexes
//! embedded in the shared slots.

mod volatile;

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicU16, AtomicU32, Ordering};

use tracing::trace;

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::sync::futex;

/// Slot is empty and writable.
const EMPTY: u32 = 0;
/// Slot holds a published payload.
const FULL: u32 = 1;
/// Slot is empty and the consumer is parked on it.
const PARKED: u32 = 2;

/// One element of the ring.
#[repr(C)]
struct Slot<T> {
    /// The payload. Only read between a successful claim of `valid` and
    /// the matching release, so the cell is never torn.
    value: UnsafeCell<MaybeUninit<T>>,
    /// Presence flag and reader futex: {0 empty, 1 full, 2 reader parked}.
    valid: AtomicU32,
    /// Two packed 15-bit deli-ticket counters ordering blocked writers.
    /// Bits 0..15: tickets issued (bit 15 is the wrap parity). Bits
    /// 16..31: writers served (bit 31 is the wrap parity). Works as long
    /// as fewer than 2^15 writers wait on one slot at once.
    write_waiters: AtomicU32,
}

/// The shared part of the ring, allocated in the pool. Every handle in
/// every process points at the same one of these.
#[repr(C)]
struct RawRing {
    /// Queue length as seen by writers. Transiently exceeds the capacity
    /// while blocking writers are parked waiting for slots.
    write_length: AtomicU32,
    /// Index of the next slot a writer will claim; wrapped with the mask
    /// after every increment.
    head_index: AtomicU32,
    /// Pool offset of the slot array.
    array_offset: u32,
    /// Capacity; always a power of two.
    array_length: u32,
}

// The ticket half is incremented by writers claiming a slot, the served
// half by the consumer after each drain. On little-endian machines the
// ticket counter is the low half of the word.
#[cfg(target_endian = "little")]
const TICKET_HALF: usize = 0;
#[cfg(target_endian = "little")]
const SERVED_HALF: usize = 1;
#[cfg(target_endian = "big")]
const TICKET_HALF: usize = 1;
#[cfg(target_endian = "big")]
const SERVED_HALF: usize = 0;

fn counter_half(word: &AtomicU32, half: usize) -> &AtomicU16 {
    unsafe { &*(word as *const AtomicU32 as *const AtomicU16).add(half) }
}

/// A per-process handle onto a shared ring.
///
/// Any number of handles may produce into the same ring, but only the
/// handle that tracks the tail may ever consume from it. A handle must
/// not be shared between threads; create one handle per thread with
/// [`MpscRing::load`].
pub struct MpscRing<T: Copy + Send> {
    raw: *mut RawRing,
    array: *mut Slot<T>,
    /// Next slot to read. Consumer-side only, so it can stay local.
    tail_index: u32,
    wrap_mask: u32,
    pool: &'static Pool,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for MpscRing<T> {}

impl<T: Copy + Send> MpscRing<T> {
    /// Builds a new ring of `size` slots in the pool.
    pub fn create(size: u32) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(Error::CapacityNotPowerOfTwo(size));
        }

        let pool = Pool::get();
        let raw = pool.allocate_value::<RawRing>().ok_or(Error::PoolExhausted)?.as_ptr();
        let array = match pool.allocate_array::<Slot<T>>(size as usize) {
            Some(array) => array.as_ptr(),
            None => {
                unsafe { pool.free_value(raw) };
                return Err(Error::PoolExhausted);
            }
        };

        unsafe {
            ptr::addr_of_mut!((*raw).write_length).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*raw).head_index).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*raw).array_offset).write(pool.offset_of(array));
            ptr::addr_of_mut!((*raw).array_length).write(size);

            for i in 0..size as usize {
                let slot = array.add(i);
                ptr::addr_of_mut!((*slot).valid).write(AtomicU32::new(EMPTY));
                ptr::addr_of_mut!((*slot).write_waiters).write(AtomicU32::new(0));
            }
        }

        trace!(offset = pool.offset_of(raw), size, "created ring");

        Ok(MpscRing {
            raw,
            array,
            tail_index: 0,
            wrap_mask: size - 1,
            pool,
            _marker: PhantomData,
        })
    }

    /// Attaches a new handle to the ring stored at `offset`.
    pub fn load(offset: u32) -> Self {
        let pool = Pool::get();
        let raw = pool.at_offset::<RawRing>(offset);
        let (array, wrap_mask) = unsafe {
            (
                pool.at_offset::<Slot<T>>((*raw).array_offset),
                (*raw).array_length - 1,
            )
        };

        MpscRing {
            raw,
            array,
            tail_index: 0,
            wrap_mask,
            pool,
            _marker: PhantomData,
        }
    }

    fn raw(&self) -> &RawRing {
        unsafe { &*self.raw }
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.raw().array_length
    }

    /// Pool offset of the shared ring state, for handing to other
    /// processes.
    pub fn offset(&self) -> u32 {
        self.pool.offset_of(self.raw)
    }

    /// Claims a future slot without blocking. On success the caller must
    /// follow up with exactly one of [`enqueue_at`](Self::enqueue_at) or
    /// [`cancel_reservation`](Self::cancel_reservation); dropping a
    /// reservation on the floor corrupts the queue.
    pub fn reserve(&mut self) -> bool {
        // Claim length first so other writers cannot write off the end.
        let old_length = self.raw().write_length.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if old_length >= self.capacity() {
            // Full; undo.
            self.raw().write_length.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        true
    }

    /// Commits an element into the slot reserved by a prior successful
    /// [`reserve`](Self::reserve).
    pub fn enqueue_at(&mut self, item: T) {
        self.do_enqueue(item, false);
    }

    /// Releases a reservation made with [`reserve`](Self::reserve) so the
    /// slot can be claimed by somebody else.
    pub fn cancel_reservation(&mut self) {
        self.raw().write_length.fetch_sub(1, Ordering::SeqCst);
    }

    /// Reserve-and-commit in one call. Returns false when the ring is
    /// full.
    pub fn enqueue(&mut self, item: T) -> bool {
        if !self.reserve() {
            return false;
        }
        self.enqueue_at(item);

        true
    }

    /// Adds an element, parking until a slot frees up if the ring is
    /// full. Lock-free whenever there is room.
    pub fn enqueue_blocking(&mut self, item: T) {
        // Take the length unconditionally; a value beyond the capacity
        // tells the consumer there are parked writers to wake.
        self.raw().write_length.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        self.do_enqueue(item, true);
    }

    fn do_enqueue(&mut self, item: T, can_block: bool) {
        // Claim the write head so no other writer targets this slot.
        let old_head = self.raw().head_index.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        // Wrap the stored counter. The local snapshot is wrapped
        // separately, in case several increments ran before any of the
        // corresponding AND operations.
        self.raw().head_index.fetch_and(self.wrap_mask, Ordering::SeqCst);
        let index = (old_head & self.wrap_mask) as usize;

        let slot = unsafe { &*self.array.add(index) };

        // Take a ticket even when not blocking; the consumer counts every
        // write against the served half.
        let ticket = counter_half(&slot.write_waiters, TICKET_HALF).fetch_add(1, Ordering::SeqCst);

        if can_block {
            self.wait_for_turn(slot, ticket);
        }

        unsafe { volatile::write_value(slot.value.get() as *mut T, &item) };

        // Only now is it safe to tell the reader there is a new element.
        fence(Ordering::SeqCst);
        let old_valid = slot.valid.swap(FULL, Ordering::SeqCst);
        assert_ne!(old_valid, FULL, "enqueue would overwrite an undrained slot");
        if old_valid == PARKED {
            let woken = futex::wake(&slot.valid, 1);
            debug_assert!(woken <= 1, "woke more than one reader on a slot");
        }
    }

    /// The deli-ticket wait: parks until the served counter reaches this
    /// writer's ticket. When the two wrap-parity bits disagree, one
    /// counter has wrapped once more than the other and the comparison
    /// inverts.
    fn wait_for_turn(&self, slot: &Slot<T>, ticket: u16) {
        let my_turn = (ticket & 0x7FFF) as u32;

        let mut waiters = slot.write_waiters.load(Ordering::SeqCst);
        loop {
            let served = (waiters >> 16) & 0x7FFF;
            let inverted = (waiters >> 15) & 1 != (waiters >> 31) & 1;
            let keep_waiting = if inverted {
                served > my_turn
            } else {
                served < my_turn
            };
            if !keep_waiting {
                break;
            }

            futex::wait(&slot.write_waiters, waiters);
            waiters = slot.write_waiters.load(Ordering::SeqCst);
        }
    }

    /// Removes the next element without blocking, or returns `None` if
    /// the ring is empty. Must only ever be called through the one
    /// consuming handle.
    pub fn dequeue_next(&mut self) -> Option<T> {
        let slot = unsafe { &*self.array.add(self.tail_index as usize) };
        if slot
            .valid
            .compare_exchange(FULL, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Nothing has been published here yet.
            return None;
        }

        let item = self.take_slot(slot);

        // Only now is it safe to tell writers there is one fewer element.
        fence(Ordering::SeqCst);
        self.raw().write_length.fetch_sub(1, Ordering::SeqCst);

        Some(item)
    }

    /// Removes the next element, parking until one is published if the
    /// ring is empty.
    pub fn dequeue_next_blocking(&mut self) -> T {
        let slot = unsafe { &*self.array.add(self.tail_index as usize) };
        if slot
            .valid
            .compare_exchange(FULL, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Empty. Advertise a parked reader by moving the slot to 2,
            // unless a writer published in the meantime.
            if slot
                .valid
                .compare_exchange(EMPTY, PARKED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                while slot.valid.load(Ordering::SeqCst) == PARKED {
                    futex::wait(&slot.valid, PARKED);
                }
            }
            // There is only one consumer, so the slot can only be full at
            // this point; claim it.
            slot.valid.swap(EMPTY, Ordering::SeqCst);
        }

        let item = self.take_slot(slot);

        fence(Ordering::SeqCst);
        let old_length = self.raw().write_length.fetch_sub(1, Ordering::SeqCst);
        if old_length > self.capacity() {
            // Writers are parked on this slot. Wake them all; the ticket
            // order selects the one that proceeds.
            futex::wake(&slot.write_waiters, i32::MAX);
        }

        item
    }

    /// Copies the next element without consuming it. A subsequent
    /// [`dequeue_next`](Self::dequeue_next) is guaranteed to succeed and
    /// return the same element.
    pub fn peek_next(&mut self) -> Option<T> {
        let slot = unsafe { &*self.array.add(self.tail_index as usize) };
        if slot.valid.load(Ordering::SeqCst) != FULL {
            return None;
        }

        // The slot stays full until this consumer clears it, so the
        // payload cannot change under us.
        Some(unsafe { volatile::read_value(slot.value.get() as *const T) })
    }

    /// Copies the next element without consuming it, parking until one is
    /// published if the ring is empty.
    pub fn peek_next_blocking(&mut self) -> T {
        let slot = unsafe { &*self.array.add(self.tail_index as usize) };
        if slot.valid.load(Ordering::SeqCst) != FULL {
            if slot
                .valid
                .compare_exchange(EMPTY, PARKED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                while slot.valid.load(Ordering::SeqCst) == PARKED {
                    futex::wait(&slot.valid, PARKED);
                }
            }
            // The waking writer published the slot; leave it full.
        }

        unsafe { volatile::read_value(slot.value.get() as *const T) }
    }

    /// Copies the payload out, advances the tail, and credits the served
    /// counter. The caller has already claimed the slot.
    fn take_slot(&mut self, slot: &Slot<T>) -> T {
        let item = unsafe { volatile::read_value(slot.value.get() as *const T) };

        self.tail_index = (self.tail_index + 1) & self.wrap_mask;

        counter_half(&slot.write_waiters, SERVED_HALF).fetch_add(1, Ordering::SeqCst);

        item
    }

    /// Frees the ring's shared memory. Expert mode: every other handle to
    /// this ring, in every process, must already be done with it.
    pub fn free(self) {
        let length = self.capacity() as usize;
        unsafe {
            self.pool.free_array(self.array, length);
            self.pool.free_value(self.raw);
        }
    }
}
