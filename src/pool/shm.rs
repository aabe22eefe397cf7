// POSIX shared memory plumbing for the pool. Kept separate from the
// allocator so all the raw fd handling lives in one place.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

pub(crate) struct ShmRegion {
    pub base: NonNull<u8>,
    /// True when this process created the region (and therefore must
    /// initialize it), false when it attached to an existing one.
    pub created: bool,
}

/// Creates or attaches to the named region and maps `len` bytes of it
/// read-write and shared. The first attacher wins the O_EXCL race and is
/// responsible for initialization.
pub(crate) fn open_shared_region(name: &str, len: usize) -> io::Result<ShmRegion> {
    let c_name = CString::new(name).expect("shared memory name contains a NUL byte");

    unsafe {
        let mut created = true;
        let mut fd = libc::shm_open(
            c_name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
        );
        if fd == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            created = false;
            fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            );
        }
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        if created && libc::ftruncate(fd, len as libc::off_t) == -1 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            libc::shm_unlink(c_name.as_ptr());
            return Err(err);
        }

        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        // The mapping stays valid after the descriptor is closed.
        libc::close(fd);

        Ok(ShmRegion {
            base: NonNull::new(addr as *mut u8).unwrap(),
            created,
        })
    }
}

/// Unmaps a region previously returned by [`open_shared_region`]. The
/// region itself survives until it is unlinked; only this process's view
/// of it goes away.
pub(crate) unsafe fn unmap_region(base: *mut u8, len: usize) -> io::Result<()> {
    if libc::munmap(base.cast(), len) == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Removes the region's name. Existing mappings stay usable; new attachers
/// will create a fresh region.
pub(crate) fn unlink_region(name: &str) -> bool {
    let c_name = CString::new(name).expect("shared memory name contains a NUL byte");
    unsafe { libc::shm_unlink(c_name.as_ptr()) == 0 }
}
