// Thin wrappers over the futex syscall. There is no glibc wrapper for
// futex, so the syscalls are made directly. The non-PRIVATE ops are used
// so that waiters in sibling processes sharing the mapping are eligible.

use std::ptr;
use std::sync::atomic::AtomicU32;

// The kernel requires the futex word to be 4-byte aligned; `AtomicU32`
// guarantees that.

unsafe fn futex_call(futex: *const AtomicU32, op: libc::c_int, val: libc::c_int) -> libc::c_long {
    libc::syscall(
        libc::SYS_futex,
        futex,
        op,
        val,
        ptr::null::<libc::timespec>(),
    )
}

/// Parks the calling thread while `*futex == expected`.
///
/// Returns `false` if the kernel reported a value mismatch (the word no
/// longer held `expected`, so the caller should re-check its condition),
/// `true` on a normal or spurious wake-up.
pub fn wait(futex: &AtomicU32, expected: u32) -> bool {
    let ret = unsafe { futex_call(futex, libc::FUTEX_WAIT, expected as libc::c_int) };
    if ret == 0 {
        return true;
    }

    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => false,
        // An interrupted wait is indistinguishable from a spurious wake-up
        // as far as callers are concerned.
        Some(libc::EINTR) => true,
        err => panic!("futex(FUTEX_WAIT) failed unexpectedly: {err:?}"),
    }
}

/// Wakes up to `waiters` threads parked on `futex`, returning how many
/// were actually woken.
pub fn wake(futex: &AtomicU32, waiters: i32) -> i32 {
    let ret = unsafe { futex_call(futex, libc::FUTEX_WAKE, waiters) };
    assert!(ret >= 0, "futex(FUTEX_WAKE) failed unexpectedly");
    ret as i32
}
