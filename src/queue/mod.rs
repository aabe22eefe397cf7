//! The fan-out queue: a registry of single-consumer rings, one per
//! consumer handle, with a producer-side enqueue that commits to every
//! live ring or to none of them.
//!
//! This queue is deliberately nonstandard in that every consumer reads
//! every message; it fans out rather than load-balancing. Two threads
//! must never share one handle; give each its own handle via
//! [`Queue::load`] or one of the fetch methods.
//!
//! A few tips to stay out of trouble:
//! * Never send anything containing a pointer unless that pointer is
//!   itself a pool offset.
//! * Sending an item costs a copy into each consumer ring, so keep
//!   payloads small or the pool runs dry fast.

use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use tracing::{debug, trace};

use crate::consts::{MAX_CONSUMERS, NAME_MAP_BUCKETS, NAME_MAP_OFFSET, QUEUE_CAPACITY};
use crate::error::{Error, Result};
use crate::map::SharedHashmap;
use crate::pool::Pool;
use crate::ring::MpscRing;
use crate::MessageQueue;

/// One slot of the shared subqueue table.
#[repr(C)]
struct SubqueueEntry {
    /// Pool offset of the consumer ring. Meaningful only once `valid` is
    /// set; published before it with a fence in between.
    offset: AtomicU32,
    /// Whether this subqueue is currently operational.
    valid: AtomicU32,
    /// Whether this slot will never be used again and may be reclaimed by
    /// a new consumer.
    dead: AtomicU32,
    /// Number of handles, across all processes, referencing the ring.
    num_references: AtomicU32,
}

/// The shared control block. Every handle in every process points at the
/// same one of these; the handles are just different views into it.
#[repr(C)]
struct RawFanout {
    /// How many subqueues currently exist. The table is usually only
    /// partially in use.
    num_subqueues: AtomicU32,
    /// Capacity of each consumer ring. Written once at creation and never
    /// modified.
    subqueue_size: u32,
    /// Bumped every time a subqueue is created or removed, so handles can
    /// skip rescanning the table when nothing changed.
    subqueue_updates: AtomicU32,
    entries: [SubqueueEntry; MAX_CONSUMERS],
}

/// A per-process handle onto a shared fan-out queue.
pub struct Queue<T: Copy + Send> {
    raw: *mut RawFanout,
    pool: &'static Pool,
    /// Local handles to the rings this process knows about, indexed like
    /// the shared table.
    subqueues: [Option<MpscRing<T>>; MAX_CONSUMERS],
    /// The table index of the ring this handle reads from, if it was
    /// created as a consumer.
    own_index: Option<usize>,
    /// Shadow of `num_subqueues` as of the last refresh.
    last_num_subqueues: u32,
    /// Shadow of `subqueue_updates` as of the last refresh.
    last_subqueue_updates: u32,
    /// Scratch list of ring indices reserved by the current enqueue,
    /// kept allocated so the fast path does not touch the heap.
    writable: Vec<usize>,
}

unsafe impl<T: Copy + Send> Send for Queue<T> {}

impl<T: Copy + Send> Queue<T> {
    /// Builds a brand-new queue whose consumer rings hold `size` items
    /// each. Normally [`fetch`](Self::fetch) is what you want; it handles
    /// creation automatically.
    ///
    /// Pass `consumer = false` for handles that only produce; a consumer
    /// ring that is never drained would otherwise fill up and stall
    /// blocking producers forever.
    pub fn create(consumer: bool, size: u32) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(Error::CapacityNotPowerOfTwo(size));
        }

        let pool = Pool::get();
        let raw = pool
            .allocate_value::<RawFanout>()
            .ok_or(Error::PoolExhausted)?
            .as_ptr();

        unsafe {
            ptr::addr_of_mut!((*raw).num_subqueues).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*raw).subqueue_size).write(size);
            ptr::addr_of_mut!((*raw).subqueue_updates).write(AtomicU32::new(0));

            // Initially every slot is unclaimed: invalid and dead.
            for i in 0..MAX_CONSUMERS {
                let entry = ptr::addr_of_mut!((*raw).entries[i]);
                ptr::addr_of_mut!((*entry).offset).write(AtomicU32::new(0));
                ptr::addr_of_mut!((*entry).valid).write(AtomicU32::new(0));
                ptr::addr_of_mut!((*entry).dead).write(AtomicU32::new(1));
                ptr::addr_of_mut!((*entry).num_references).write(AtomicU32::new(0));
            }
        }

        trace!(offset = pool.offset_of(raw), size, "created fan-out queue");

        Self::init_local(pool, raw, consumer)
    }

    /// Attaches a new handle to the queue stored at `offset`.
    pub fn load(consumer: bool, offset: u32) -> Result<Self> {
        let pool = Pool::get();
        let raw = pool.at_offset::<RawFanout>(offset);

        Self::init_local(pool, raw, consumer)
    }

    fn init_local(pool: &'static Pool, raw: *mut RawFanout, consumer: bool) -> Result<Self> {
        let mut queue = Queue {
            raw,
            pool,
            subqueues: std::array::from_fn(|_| None),
            own_index: None,
            last_num_subqueues: 0,
            last_subqueue_updates: 0,
            writable: Vec::with_capacity(MAX_CONSUMERS),
        };

        // Attaching as a consumer is the principal way of getting a new
        // handle onto the same queue, and every consumer reads from its
        // own dedicated ring.
        if consumer {
            queue.make_own_subqueue()?;
        }

        Ok(queue)
    }

    /// Fetches the queue registered under `name`, creating it if it does
    /// not exist. The handle can both produce and consume.
    pub fn fetch(name: &str) -> Result<Self> {
        Self::do_fetch(name, true, QUEUE_CAPACITY)
    }

    /// Like [`fetch`](Self::fetch), but the handle can only produce.
    pub fn fetch_producer(name: &str) -> Result<Self> {
        Self::do_fetch(name, false, QUEUE_CAPACITY)
    }

    /// Like [`fetch`](Self::fetch) with a caller-chosen ring capacity.
    /// `size` must be a power of two and is ignored when the queue
    /// already exists.
    pub fn fetch_sized(name: &str, size: u32) -> Result<Self> {
        Self::do_fetch(name, true, size)
    }

    /// Like [`fetch_sized`](Self::fetch_sized) for producer-only handles.
    pub fn fetch_sized_producer(name: &str, size: u32) -> Result<Self> {
        Self::do_fetch(name, false, size)
    }

    fn do_fetch(name: &str, consumer: bool, size: u32) -> Result<Self> {
        let names = SharedHashmap::<&str, u32>::new(NAME_MAP_OFFSET, NAME_MAP_BUCKETS);

        if let Some(offset) = names.fetch(name) {
            // The queue exists; just make a new handle to it.
            return Self::load(consumer, offset);
        }

        let queue = Self::create(consumer, size)?;
        names.add_or_set(name, queue.offset());
        debug!(name, offset = queue.offset(), "registered queue name");

        Ok(queue)
    }

    /// Creates this handle's own consumer ring and publishes it in the
    /// shared table.
    fn make_own_subqueue(&mut self) -> Result<()> {
        let raw = unsafe { &*self.raw };

        // Claim a dead slot to write over.
        let mut claimed = None;
        for i in 0..MAX_CONSUMERS {
            let was_dead = raw.entries[i]
                .dead
                .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            fence(Ordering::SeqCst);

            if was_dead {
                claimed = Some(i);
                break;
            }
        }
        let index = claimed.expect("exceeded the maximum number of consumers");

        let ring = match MpscRing::create(raw.subqueue_size) {
            Ok(ring) => ring,
            Err(err) => {
                // Give the slot back before bailing out.
                raw.entries[index].dead.swap(1, Ordering::SeqCst);
                return Err(err);
            }
        };
        let entry = &raw.entries[index];
        entry.offset.store(ring.offset(), Ordering::SeqCst);
        entry.num_references.store(1, Ordering::SeqCst);

        // Only once the ring is fully constructed may other handles see
        // the entry as valid.
        fence(Ordering::SeqCst);
        entry.valid.swap(1, Ordering::SeqCst);

        self.last_num_subqueues += 1;
        self.last_subqueue_updates += 1;
        fence(Ordering::SeqCst);
        raw.subqueue_updates.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        raw.num_subqueues.fetch_add(1, Ordering::SeqCst);

        debug!(index, offset = ring.offset(), "registered consumer subqueue");

        self.subqueues[index] = Some(ring);
        self.own_index = Some(index);

        Ok(())
    }

    /// Attaches to a ring advertised by another handle. Fails when its
    /// reference count already hit zero, which means the ring was freed
    /// while we were looking at it.
    fn add_subqueue(&mut self, index: usize) -> bool {
        let entry = unsafe { &(*self.raw).entries[index] };

        loop {
            let references = entry.num_references.load(Ordering::SeqCst);
            fence(Ordering::SeqCst);

            if references == 0 {
                return false;
            }

            // Several handles may be attaching or detaching at once, so
            // the increment has to re-verify the snapshot.
            if entry
                .num_references
                .compare_exchange(references, references + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let offset = entry.offset.load(Ordering::SeqCst);
        self.subqueues[index] = Some(MpscRing::load(offset));
        trace!(index, offset, "attached subqueue");

        true
    }

    /// Drops our reference to a ring, freeing its shared memory if this
    /// was the last one anywhere.
    fn remove_subqueue(&mut self, index: usize) {
        let entry = unsafe { &(*self.raw).entries[index] };

        let references = entry.num_references.fetch_sub(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let ring = self.subqueues[index].take();

        if references == 1 {
            // The count just hit zero; the backing ring goes away.
            ring.expect("removing a subqueue that was never attached").free();

            // Only now is the slot safe to reuse.
            fence(Ordering::SeqCst);
            entry.dead.swap(1, Ordering::SeqCst);
        }

        trace!(index, "removed subqueue");
    }

    /// Reconciles the local ring table with the shared one. Cheap when
    /// nothing changed.
    fn incorporate_new_subqueues(&mut self) {
        let updates = unsafe { &*self.raw }.subqueue_updates.load(Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if updates == self.last_subqueue_updates {
            return;
        }

        for i in 0..MAX_CONSUMERS {
            let valid = unsafe { &(*self.raw).entries[i] }.valid.load(Ordering::SeqCst) != 0;

            if valid && self.subqueues[i].is_none() {
                if self.add_subqueue(i) {
                    self.last_num_subqueues += 1;
                }
            } else if !valid && self.subqueues[i].is_some() {
                self.remove_subqueue(i);
                self.last_num_subqueues -= 1;
            }
        }

        self.last_subqueue_updates = updates;
    }

    /// Adds an element to every live consumer ring, or to none. Returns
    /// false when any ring is full, or when there are no consumers at all
    /// (a message with no possible reader is dropped, not queued).
    pub fn enqueue(&mut self, item: T) -> bool {
        self.incorporate_new_subqueues();

        if self.last_num_subqueues == 0 {
            return false;
        }

        self.writable.clear();

        // Reserve everywhere before committing anywhere, so a full ring
        // aborts the whole send without a partial fan-out.
        for i in 0..MAX_CONSUMERS {
            if self.subqueues[i].is_none() {
                continue;
            }

            if !self.subqueues[i].as_mut().unwrap().reserve() {
                for j in 0..self.writable.len() {
                    let reserved = self.writable[j];
                    self.subqueues[reserved].as_mut().unwrap().cancel_reservation();
                }
                return false;
            }

            self.writable.push(i);
            if self.writable.len() == self.last_num_subqueues as usize {
                // We've seen every ring that exists.
                break;
            }
        }
        // The table cannot change behind our back between the refresh and
        // here; only this handle touches its local view.
        debug_assert_eq!(self.writable.len(), self.last_num_subqueues as usize);

        for j in 0..self.writable.len() {
            let reserved = self.writable[j];
            self.subqueues[reserved].as_mut().unwrap().enqueue_at(item);
        }

        true
    }

    /// Adds an element to every live consumer ring, parking at each full
    /// ring until it drains. Returns false only when there are no
    /// consumers.
    ///
    /// The walk over the rings is not atomic: a slow consumer stalls
    /// delivery to the rings after it. That is the cost of guaranteeing
    /// that every live consumer sees every message.
    pub fn enqueue_blocking(&mut self, item: T) -> bool {
        self.incorporate_new_subqueues();

        if self.last_num_subqueues == 0 {
            return false;
        }

        let mut written = 0;
        for i in 0..MAX_CONSUMERS {
            if self.subqueues[i].is_none() {
                continue;
            }

            self.subqueues[i].as_mut().unwrap().enqueue_blocking(item);

            written += 1;
            if written == self.last_num_subqueues {
                break;
            }
        }
        debug_assert_eq!(written, self.last_num_subqueues);

        true
    }

    /// Reads the next element off this handle's own ring without
    /// blocking. Panics if the handle was not created as a consumer.
    pub fn dequeue_next(&mut self) -> Option<T> {
        let index = self.own_index.expect("this queue handle is not a consumer");
        self.subqueues[index].as_mut().unwrap().dequeue_next()
    }

    /// Reads the next element off this handle's own ring, parking until
    /// one arrives. Panics if the handle was not created as a consumer.
    pub fn dequeue_next_blocking(&mut self) -> T {
        let index = self.own_index.expect("this queue handle is not a consumer");
        self.subqueues[index].as_mut().unwrap().dequeue_next_blocking()
    }

    /// Copies the next element without consuming it; the following
    /// [`dequeue_next`](Self::dequeue_next) returns the same element.
    pub fn peek_next(&mut self) -> Option<T> {
        let index = self.own_index.expect("this queue handle is not a consumer");
        self.subqueues[index].as_mut().unwrap().peek_next()
    }

    /// Blocking variant of [`peek_next`](Self::peek_next).
    pub fn peek_next_blocking(&mut self) -> T {
        let index = self.own_index.expect("this queue handle is not a consumer");
        self.subqueues[index].as_mut().unwrap().peek_next_blocking()
    }

    /// Number of consumers currently registered on the queue.
    pub fn num_consumers(&self) -> u32 {
        unsafe { &*self.raw }.num_subqueues.load(Ordering::SeqCst)
    }

    /// Pool offset of the shared control block, for handing to other
    /// processes.
    pub fn offset(&self) -> u32 {
        self.pool.offset_of(self.raw)
    }

    /// Frees the queue's shared memory: every subqueue ring this handle
    /// can see, plus the control block. Expert mode: after this, no
    /// handle in any process may touch the queue again.
    pub fn free_queue(mut self) {
        // Pick up any rings created since our last refresh so nothing is
        // leaked.
        self.incorporate_new_subqueues();

        for i in 0..MAX_CONSUMERS {
            if let Some(ring) = self.subqueues[i].take() {
                ring.free();
            }
        }

        unsafe { self.pool.free_value(self.raw) };

        // The control block is gone, so the drop-time unregistration has
        // nothing left to update.
        let _scratch = mem::take(&mut self.writable);
        mem::forget(self);
    }
}

impl<T: Copy + Send> Drop for Queue<T> {
    fn drop(&mut self) {
        if let Some(index) = self.own_index {
            let raw = unsafe { &*self.raw };

            // Our ring will never be read again; keep anyone from writing
            // to it first.
            raw.entries[index].valid.swap(0, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            raw.num_subqueues.fetch_sub(1, Ordering::SeqCst);
            // Still counts as an update.
            fence(Ordering::SeqCst);
            raw.subqueue_updates.fetch_add(1, Ordering::SeqCst);
        }

        // Drop every ring reference we still hold, freeing rings whose
        // count hits zero.
        for i in 0..MAX_CONSUMERS {
            if self.subqueues[i].is_some() {
                self.remove_subqueue(i);
            }
        }
    }
}

impl<T: Copy + Send> MessageQueue<T> for Queue<T> {
    fn enqueue(&mut self, item: T) -> bool {
        Queue::enqueue(self, item)
    }

    fn enqueue_blocking(&mut self, item: T) -> bool {
        Queue::enqueue_blocking(self, item)
    }

    fn dequeue_next(&mut self) -> Option<T> {
        Queue::dequeue_next(self)
    }

    fn dequeue_next_blocking(&mut self) -> T {
        Queue::dequeue_next_blocking(self)
    }

    fn peek_next(&mut self) -> Option<T> {
        Queue::peek_next(self)
    }

    fn peek_next_blocking(&mut self) -> T {
        Queue::peek_next_blocking(self)
    }

    fn num_consumers(&self) -> u32 {
        Queue::num_consumers(self)
    }

    fn offset(&self) -> u32 {
        Queue::offset(self)
    }
}
