//! The shared memory pool. One process-wide singleton maps the region that
//! every queue, ring, and hashmap lives in, and serves variable-size
//! allocations out of it with a block-granular bitmap allocator.
//!
//! Layout of the mapping: `[PoolHeader | block bitmap | data]`, with the
//! data region aligned to [`BLOCK_SIZE`]. Cross-process references into the
//! pool are always byte offsets relative to `data`; native pointers are
//! meaningless in another process.

mod shm;

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use tracing::debug;

use crate::consts::{BLOCK_SIZE, POOL_SIZE, SHM_NAME};
use crate::sync::Mutex;

/// Lives at the very start of the mapping and tracks everything the
/// allocator needs to share between processes.
#[repr(C)]
struct PoolHeader {
    /// Size of the data region in bytes.
    size: u32,
    /// Number of blocks in the data region.
    num_blocks: u32,
    /// Serializes bitmap scans and updates.
    allocation_lock: Mutex,
}

/// Sizing derived from the requested data size; every process computes the
/// same numbers from the constants in `consts.rs`.
struct Layout {
    data_size: usize,
    num_blocks: usize,
    block_bytes: usize,
    header_overhead: usize,
    total_size: usize,
}

fn compute_layout(size: usize) -> Layout {
    let data_size = size.next_multiple_of(BLOCK_SIZE);
    let num_blocks = data_size / BLOCK_SIZE;
    // One bit per block.
    let block_bytes = num_blocks.div_ceil(8);
    let header_overhead = (mem::size_of::<PoolHeader>() + block_bytes).next_multiple_of(BLOCK_SIZE);

    Layout {
        data_size,
        num_blocks,
        block_bytes,
        header_overhead,
        total_size: header_overhead + data_size,
    }
}

/// Manages the pool of shared memory that queue state is carved from.
pub struct Pool {
    header: *mut PoolHeader,
    /// The block bitmap: bit N is 1 iff block N is owned by a live
    /// allocation.
    bitmap: *mut u8,
    /// Start of the data region.
    data: *mut u8,
    block_bytes: usize,
    /// Size of the whole mapping, for unmapping it at teardown.
    total_size: usize,
}

// All shared mutable state is behind the in-pool mutex or atomics.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

static SINGLETON: OnceLock<Pool> = OnceLock::new();

extern "C" fn unmap_pool_at_exit() {
    if let Some(pool) = SINGLETON.get() {
        // A failed unmap this late has nobody left to care.
        let _ = unsafe { shm::unmap_region(pool.header.cast(), pool.total_size) };
    }
}

impl Pool {
    /// Returns the process-wide pool, mapping (and, for the first process
    /// on the host, creating) it on first use.
    pub fn get() -> &'static Pool {
        SINGLETON.get_or_init(|| {
            let pool = Pool::map(POOL_SIZE).expect("mapping the shared memory pool failed");

            // The singleton lives for the whole process, so its mapping is
            // returned at exit rather than on drop.
            unsafe { libc::atexit(unmap_pool_at_exit) };

            pool
        })
    }

    fn map(size: usize) -> std::io::Result<Pool> {
        let layout = compute_layout(size);
        let region = shm::open_shared_region(SHM_NAME, layout.total_size)?;

        let base = region.base.as_ptr();
        let header = base as *mut PoolHeader;
        let bitmap = unsafe { base.add(mem::size_of::<PoolHeader>()) };
        let data = unsafe { base.add(layout.header_overhead) };

        if region.created {
            unsafe {
                ptr::addr_of_mut!((*header).size).write(layout.data_size as u32);
                ptr::addr_of_mut!((*header).num_blocks).write(layout.num_blocks as u32);
                Mutex::init_in_place(ptr::addr_of_mut!((*header).allocation_lock));
                // Nothing is allocated initially.
                ptr::write_bytes(bitmap, 0, layout.block_bytes);
            }
            debug!(name = SHM_NAME, size = layout.data_size, "created shared memory pool");
        } else {
            debug!(name = SHM_NAME, "attached to existing shared memory pool");
        }

        Ok(Pool {
            header,
            bitmap,
            data,
            block_bytes: layout.block_bytes,
            total_size: layout.total_size,
        })
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*self.header }
    }

    /// Size of the data region in bytes.
    pub fn size(&self) -> usize {
        self.header().size as usize
    }

    /// The allocation granularity. Requests smaller than one block still
    /// occupy a whole block.
    pub const fn block_size() -> usize {
        BLOCK_SIZE
    }

    /// Allocates `size` bytes from the pool, or `None` if no free run of
    /// blocks is large enough. The returned memory is uninitialized.
    ///
    /// The smallest free run that fits is chosen to limit fragmentation;
    /// ties go to the lowest offset.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "allocating a zero-length block");
        let blocks = size.div_ceil(BLOCK_SIZE);
        let num_blocks = self.header().num_blocks as usize;

        let _guard = self.header().allocation_lock.lock();

        // Best-fit scan over the bitmap.
        let mut best: Option<(usize, usize)> = None; // (start, run length)
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for block in 0..num_blocks {
            if self.bit(block) {
                if run_len >= blocks && best.map_or(true, |(_, len)| run_len < len) {
                    best = Some((run_start, run_len));
                }
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
            }
        }
        if run_len >= blocks && best.map_or(true, |(_, len)| run_len < len) {
            best = Some((run_start, run_len));
        }

        let (start, _) = best?;
        unsafe {
            self.set_range(start, blocks, true);
            Some(NonNull::new_unchecked(self.data.add(start * BLOCK_SIZE)))
        }
    }

    /// Places an allocation of `size` bytes at the given byte offset in the
    /// data region, or `None` if any block in that range is already
    /// occupied. Used to put structures at well-known locations.
    pub fn allocate_at(&self, offset: u32, size: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "allocating a zero-length block");
        let offset = offset as usize;
        assert!(
            offset + size <= self.size(),
            "placement allocation does not fit in the pool"
        );

        let start_block = offset / BLOCK_SIZE;
        let end_block = (offset + size - 1) / BLOCK_SIZE;

        let _guard = self.header().allocation_lock.lock();

        if !self.range_is_free(start_block, end_block) {
            return None;
        }

        unsafe {
            self.set_range(start_block, end_block - start_block + 1, true);
            Some(NonNull::new_unchecked(self.data.add(offset)))
        }
    }

    /// Returns a block of `size` bytes starting at `block` to the pool.
    ///
    /// The caller must own the allocation and must not touch it afterwards.
    pub unsafe fn free(&self, block: *mut u8, size: usize) {
        let offset = self.offset_of(block) as usize;
        let start_block = offset / BLOCK_SIZE;
        let end_block = (offset + size - 1) / BLOCK_SIZE;

        let _guard = self.header().allocation_lock.lock();
        self.set_range(start_block, end_block - start_block + 1, false);
    }

    /// Allocates uninitialized space for a `T`.
    pub fn allocate_value<T>(&self) -> Option<NonNull<T>> {
        self.allocate(mem::size_of::<T>()).map(NonNull::cast)
    }

    /// Allocates uninitialized space for `[T; len]`.
    pub fn allocate_array<T>(&self, len: usize) -> Option<NonNull<T>> {
        self.allocate(mem::size_of::<T>() * len).map(NonNull::cast)
    }

    /// Allocates uninitialized space for a `T` at a fixed offset.
    pub fn allocate_value_at<T>(&self, offset: u32) -> Option<NonNull<T>> {
        self.allocate_at(offset, mem::size_of::<T>()).map(NonNull::cast)
    }

    /// Frees the storage of a `T` previously handed out by the pool.
    pub unsafe fn free_value<T>(&self, value: *mut T) {
        self.free(value as *mut u8, mem::size_of::<T>());
    }

    /// Frees the storage of a `[T; len]` previously handed out by the pool.
    pub unsafe fn free_array<T>(&self, array: *mut T, len: usize) {
        self.free(array as *mut u8, mem::size_of::<T>() * len);
    }

    /// Reports whether the block covering `offset` is marked occupied.
    pub fn is_used(&self, offset: u32) -> bool {
        let _guard = self.header().allocation_lock.lock();
        self.bit(offset as usize / BLOCK_SIZE)
    }

    /// Translates a pool-relative byte offset into a local pointer.
    pub fn at_offset<T>(&self, offset: u32) -> *mut T {
        assert!((offset as usize) < self.size(), "offset is out of bounds");
        unsafe { self.data.add(offset as usize) as *mut T }
    }

    /// Translates a pointer into pool memory back into its byte offset, the
    /// only representation that is meaningful to other processes.
    pub fn offset_of<T>(&self, shared_object: *const T) -> u32 {
        let addr = shared_object as usize;
        let data = self.data as usize;
        debug_assert!(addr >= data && addr - data < self.size());
        (addr - data) as u32
    }

    /// Marks every block as free. The data bytes themselves are left in
    /// place; re-attachers that skip re-creation will still see them.
    pub fn clear(&self) {
        let _guard = self.header().allocation_lock.lock();
        unsafe { ptr::write_bytes(self.bitmap, 0, self.block_bytes) };
    }

    /// Removes the shared memory name from the system. Live mappings keep
    /// working; the next process to start will create a fresh pool.
    pub fn unlink() -> bool {
        shm::unlink_region(SHM_NAME)
    }

    fn bit(&self, block: usize) -> bool {
        let byte = unsafe { *self.bitmap.add(block >> 3) };
        byte & (1 << (block & 7)) != 0
    }

    /// Tests that every block in `start..=end` is free. The full bytes in
    /// the middle are checked eight at a time.
    fn range_is_free(&self, start: usize, end: usize) -> bool {
        let start_byte = start >> 3;
        let end_byte = end >> 3;

        if start_byte == end_byte {
            let mask = (!0u8 << (start & 7)) & (!0u8 >> (7 - (end & 7)));
            return unsafe { *self.bitmap.add(start_byte) } & mask == 0;
        }

        let head_mask = !0u8 << (start & 7);
        if unsafe { *self.bitmap.add(start_byte) } & head_mask != 0 {
            return false;
        }
        let tail_mask = !0u8 >> (7 - (end & 7));
        if unsafe { *self.bitmap.add(end_byte) } & tail_mask != 0 {
            return false;
        }

        let mut byte = start_byte + 1;
        while byte + 8 <= end_byte {
            let chunk = unsafe { (self.bitmap.add(byte) as *const u64).read_unaligned() };
            if chunk != 0 {
                return false;
            }
            byte += 8;
        }
        while byte < end_byte {
            if unsafe { *self.bitmap.add(byte) } != 0 {
                return false;
            }
            byte += 1;
        }

        true
    }

    /// Sets or clears `count` bitmap bits starting at `start`. Whole bytes
    /// in the middle are filled at once.
    unsafe fn set_range(&self, start: usize, count: usize, used: bool) {
        debug_assert!(count > 0);
        let end = start + count - 1;
        let start_byte = start >> 3;
        let end_byte = end >> 3;

        let head_mask = !0u8 << (start & 7);
        let tail_mask = !0u8 >> (7 - (end & 7));

        if start_byte == end_byte {
            let mask = head_mask & tail_mask;
            if used {
                *self.bitmap.add(start_byte) |= mask;
            } else {
                *self.bitmap.add(start_byte) &= !mask;
            }
            return;
        }

        if used {
            *self.bitmap.add(start_byte) |= head_mask;
            *self.bitmap.add(end_byte) |= tail_mask;
        } else {
            *self.bitmap.add(start_byte) &= !head_mask;
            *self.bitmap.add(end_byte) &= !tail_mask;
        }

        if end_byte - start_byte >= 2 {
            let fill = if used { 0xFF } else { 0 };
            ptr::write_bytes(self.bitmap.add(start_byte + 1), fill, end_byte - start_byte - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_block_aligned() {
        let layout = compute_layout(POOL_SIZE);
        assert_eq!(0, layout.data_size % BLOCK_SIZE);
        assert_eq!(0, layout.header_overhead % BLOCK_SIZE);
        assert_eq!(layout.num_blocks, layout.data_size / BLOCK_SIZE);
        assert!(layout.block_bytes * 8 >= layout.num_blocks);
        assert_eq!(layout.total_size, layout.data_size + layout.header_overhead);
    }
}
