//! A fixed-bucket chained hashmap living in the pool, shared by every
//! process. One intra-pool mutex serializes all operations; this map backs
//! slow-path discovery (the queue name registry), not message traffic.
//!
//! Keys come in two families behind the [`MapKey`] trait: trivially
//! copyable scalars stored inline, and string keys whose bytes are copied
//! into pool memory so that the bucket holds only a pool offset. Chain
//! links are pool offsets too; no native pointer is ever stored in the
//! map.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;

use tracing::debug;

use crate::pool::Pool;
use crate::sync::Mutex;

/// Chain terminator. Offset 0 is the registry header, never a bucket, but
/// the all-ones sentinel avoids leaning on that.
const NO_NEXT: u32 = u32::MAX;

/// A key usable in a [`SharedHashmap`].
///
/// The hash must be deterministic across processes, which is why the
/// implementations below use an explicitly seeded [`DefaultHasher`] rather
/// than the per-process randomized state of `std::collections::HashMap`.
pub trait MapKey: Copy {
    /// The fixed-size, trivially copyable representation kept in the
    /// bucket.
    type Stored: Copy;

    /// Converts the key into its stored form, copying any indirect data
    /// into pool memory.
    fn store(&self, pool: &Pool) -> Self::Stored;

    /// Compares a stored key against a lookup key.
    fn matches(stored: &Self::Stored, key: &Self, pool: &Pool) -> bool;

    /// Hashes the key.
    fn hash_key(&self) -> u64;
}

macro_rules! scalar_map_key {
    ($($ty:ty),* $(,)?) => {$(
        impl MapKey for $ty {
            type Stored = $ty;

            fn store(&self, _pool: &Pool) -> $ty {
                *self
            }

            fn matches(stored: &$ty, key: &$ty, _pool: &Pool) -> bool {
                stored == key
            }

            fn hash_key(&self) -> u64 {
                let mut hasher = DefaultHasher::new();
                self.hash(&mut hasher);
                hasher.finish()
            }
        }
    )*};
}

scalar_map_key!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// Stored form of a string key: the bytes live in the pool.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct StoredStr {
    offset: u32,
    len: u32,
}

impl MapKey for &str {
    type Stored = StoredStr;

    fn store(&self, pool: &Pool) -> StoredStr {
        let storage = pool
            .allocate(self.len().max(1))
            .expect("out of pool memory for a map key");
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr(), storage.as_ptr(), self.len());
        }

        StoredStr {
            offset: pool.offset_of(storage.as_ptr()),
            len: self.len() as u32,
        }
    }

    fn matches(stored: &StoredStr, key: &Self, pool: &Pool) -> bool {
        if stored.len as usize != key.len() {
            return false;
        }
        let bytes =
            unsafe { std::slice::from_raw_parts(pool.at_offset::<u8>(stored.offset), stored.len as usize) };
        bytes == key.as_bytes()
    }

    fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// One storage location. The fixed bucket array provides the chain heads;
/// overflow buckets are allocated from the pool and linked by offset.
#[repr(C)]
struct Bucket<S, V> {
    occupied: bool,
    key: MaybeUninit<S>,
    value: MaybeUninit<V>,
    /// Pool offset of the next bucket in this chain, or [`NO_NEXT`].
    next: u32,
}

/// The in-pool header recording where the map's pieces went.
#[repr(C)]
struct MapHeader {
    data_offset: u32,
    lock_offset: u32,
}

/// A per-process handle onto a shared map.
pub struct SharedHashmap<K: MapKey, V: Copy> {
    header: *mut MapHeader,
    buckets: *mut Bucket<K::Stored, V>,
    lock: *mut Mutex,
    num_buckets: usize,
    pool: &'static Pool,
    _marker: PhantomData<(K, V)>,
}

unsafe impl<K: MapKey, V: Copy> Send for SharedHashmap<K, V> {}

impl<K: MapKey, V: Copy> SharedHashmap<K, V> {
    /// Creates a map with its header at `offset`, or attaches to the one
    /// already there. The first process to claim the offset builds the
    /// bucket array; everyone else discovers it through the header.
    pub fn new(offset: u32, num_buckets: usize) -> Self {
        let pool = Pool::get();

        if !pool.is_used(offset) {
            // The placement allocation doubles as the creation race
            // arbiter: losing it means somebody else just built the map.
            if let Some(header) = pool.allocate_value_at::<MapHeader>(offset) {
                return Self::build(pool, header.as_ptr(), num_buckets);
            }
        }

        let header = pool.at_offset::<MapHeader>(offset);
        let (buckets, lock) = unsafe {
            (
                pool.at_offset::<Bucket<K::Stored, V>>((*header).data_offset),
                pool.at_offset::<Mutex>((*header).lock_offset),
            )
        };

        SharedHashmap {
            header,
            buckets,
            lock,
            num_buckets,
            pool,
            _marker: PhantomData,
        }
    }

    fn build(pool: &'static Pool, header: *mut MapHeader, num_buckets: usize) -> Self {
        let buckets = pool
            .allocate_array::<Bucket<K::Stored, V>>(num_buckets)
            .expect("out of pool memory for the bucket array")
            .as_ptr();
        for i in 0..num_buckets {
            unsafe {
                let bucket = buckets.add(i);
                ptr::addr_of_mut!((*bucket).occupied).write(false);
                ptr::addr_of_mut!((*bucket).next).write(NO_NEXT);
            }
        }

        let lock = pool
            .allocate_value::<Mutex>()
            .expect("out of pool memory for the map lock")
            .as_ptr();
        unsafe {
            Mutex::init_in_place(lock);

            ptr::addr_of_mut!((*header).data_offset).write(pool.offset_of(buckets));
            ptr::addr_of_mut!((*header).lock_offset).write(pool.offset_of(lock));
        }

        debug!(
            offset = pool.offset_of(header),
            num_buckets, "created shared hashmap"
        );

        SharedHashmap {
            header,
            buckets,
            lock,
            num_buckets,
            pool,
            _marker: PhantomData,
        }
    }

    fn lock(&self) -> &Mutex {
        unsafe { &*self.lock }
    }

    /// Walks to the bucket holding `key`, or to the bucket where it could
    /// be placed: an unoccupied chain head, or the occupied tail of the
    /// chain when the key is absent.
    fn find_bucket(&self, key: &K) -> *mut Bucket<K::Stored, V> {
        let slot = (key.hash_key() % self.num_buckets as u64) as usize;

        let mut bucket = unsafe { self.buckets.add(slot) };
        loop {
            let current = unsafe { &*bucket };
            if !current.occupied {
                return bucket;
            }
            let stored = unsafe { current.key.assume_init_ref() };
            if K::matches(stored, key, self.pool) {
                return bucket;
            }
            if current.next == NO_NEXT {
                return bucket;
            }
            bucket = self.pool.at_offset(current.next);
        }
    }

    /// Adds a new item to the map, or overwrites the value of an existing
    /// one.
    pub fn add_or_set(&self, key: K, value: V) {
        let _guard = self.lock().lock();

        let mut bucket = unsafe { &mut *self.find_bucket(&key) };

        let matched = bucket.occupied
            && K::matches(unsafe { bucket.key.assume_init_ref() }, &key, self.pool);
        if bucket.occupied && !matched {
            // End of a chain with no match; append a fresh bucket.
            let appended = self
                .pool
                .allocate_value::<Bucket<K::Stored, V>>()
                .expect("out of pool memory for a chain bucket")
                .as_ptr();
            unsafe {
                ptr::addr_of_mut!((*appended).occupied).write(false);
                ptr::addr_of_mut!((*appended).next).write(NO_NEXT);
            }
            bucket.next = self.pool.offset_of(appended);
            bucket = unsafe { &mut *appended };
        }

        if !bucket.occupied {
            bucket.key = MaybeUninit::new(key.store(self.pool));
            bucket.occupied = true;
        }
        bucket.value = MaybeUninit::new(value);
    }

    /// Looks up the current value for `key`.
    pub fn fetch(&self, key: K) -> Option<V> {
        let _guard = self.lock().lock();

        let bucket = unsafe { &*self.find_bucket(&key) };
        if bucket.occupied
            && K::matches(unsafe { bucket.key.assume_init_ref() }, &key, self.pool)
        {
            Some(unsafe { bucket.value.assume_init_read() })
        } else {
            None
        }
    }

    /// Frees the map's pool storage: every chain bucket, the bucket
    /// array, and the lock. Only call this when every process is done
    /// with the map.
    pub fn free(self) {
        for i in 0..self.num_buckets {
            let mut next = unsafe { (*self.buckets.add(i)).next };
            while next != NO_NEXT {
                let bucket = self.pool.at_offset::<Bucket<K::Stored, V>>(next);
                next = unsafe { (*bucket).next };
                unsafe { self.pool.free_value(bucket) };
            }
        }

        unsafe {
            self.pool.free_array(self.buckets, self.num_buckets);
            self.pool.free_value(self.lock);
            self.pool.free_value(self.header);
        }
    }
}
