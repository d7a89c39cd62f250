//! Futex wait/wake.
//!
//! Both operations may return spuriously; callers loop on their condition.
//! Unexpected kernel errors are unrecoverable and abort the process.

use core::sync::atomic::AtomicI32;

/// Block until `*word != expected`, a wake arrives, or spuriously.
#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) fn wait(word: &AtomicI32, expected: i32) {
    loop {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                core::ptr::null::<libc::timespec>(),
            )
        };
        if rc == 0 {
            return;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            // Value already changed.
            Some(libc::EAGAIN) => return,
            // Interrupted by signal: retry.
            Some(libc::EINTR) => continue,
            err => crate::die(&format!("futex wait failed: {err:?}")),
        }
    }
}

/// Wake up to `n` threads blocked in [`wait`] on `word`.
#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) fn wake(word: &AtomicI32, n: i32) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
        )
    };
    if rc < 0 {
        crate::die(&format!(
            "futex wake failed: {:?}",
            std::io::Error::last_os_error().raw_os_error()
        ));
    }
}

// Portable fallback: a single yield stands in for the park. Spurious
// returns are part of the contract, so callers re-check and call again.
#[cfg(not(all(target_os = "linux", not(miri))))]
pub(crate) fn wait(word: &AtomicI32, expected: i32) {
    if word.load(core::sync::atomic::Ordering::SeqCst) != expected {
        return;
    }
    std::thread::yield_now();
}

#[cfg(not(all(target_os = "linux", not(miri))))]
pub(crate) fn wake(_word: &AtomicI32, _n: i32) {}
