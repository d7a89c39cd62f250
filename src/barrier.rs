//! Asymmetric process-wide memory barriers.
//!
//! The write side calls [`broadcast`], which forces a full fence on every
//! CPU in the process; the read side calls [`reader_fence`], which is a
//! compiler-only fence whenever a broadcast mechanism is available. The
//! contract is the pairing, not the mechanism: when no broadcast primitive
//! exists, both sides degrade to full `SeqCst` fences.
//!
//! Strategy selection (once, on first use):
//! 1. `sys_membarrier(PRIVATE_EXPEDITED)` if the kernel supports it,
//! 2. the `mprotect` page-flip trick on x86 (older kernels),
//! 3. `fence(SeqCst)` everywhere.

use core::sync::atomic::{compiler_fence, fence, AtomicU8, Ordering};

const STRATEGY_MEMBARRIER: u8 = 0;
const STRATEGY_MPROTECT: u8 = 1;
const STRATEGY_FALLBACK: u8 = 2;
const STRATEGY_UNDECIDED: u8 = 3;

static STRATEGY: AtomicU8 = AtomicU8::new(STRATEGY_UNDECIDED);

#[inline]
fn strategy() -> u8 {
    let s = STRATEGY.load(Ordering::Acquire);
    if s != STRATEGY_UNDECIDED {
        s
    } else {
        detect()
    }
}

#[cold]
fn detect() -> u8 {
    let s = pick_strategy();
    log::debug!(
        "asymmetric barrier strategy: {}",
        match s {
            STRATEGY_MEMBARRIER => "membarrier",
            STRATEGY_MPROTECT => "mprotect",
            _ => "seqcst-fence",
        }
    );
    // Racing detections agree on the result; last store wins harmlessly.
    STRATEGY.store(s, Ordering::Release);
    s
}

/// Full fence observed by every CPU in the process. Write side only.
#[inline]
pub(crate) fn broadcast() {
    match strategy() {
        #[cfg(all(target_os = "linux", feature = "fast-barrier", not(miri)))]
        STRATEGY_MEMBARRIER => sys::membarrier_barrier(),
        #[cfg(all(target_os = "linux", feature = "fast-barrier", not(miri)))]
        STRATEGY_MPROTECT => sys::mprotect_barrier(),
        _ => fence(Ordering::SeqCst),
    }
}

/// Read-side half of the pairing. Compiler-only when a broadcast
/// mechanism is active, otherwise a full fence.
#[inline]
pub(crate) fn reader_fence() {
    if strategy() == STRATEGY_FALLBACK {
        fence(Ordering::SeqCst);
    } else {
        compiler_fence(Ordering::SeqCst);
    }
}

#[cfg(all(target_os = "linux", feature = "fast-barrier", not(miri)))]
fn pick_strategy() -> u8 {
    if sys::membarrier_supported() {
        STRATEGY_MEMBARRIER
    } else if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        STRATEGY_MPROTECT
    } else {
        STRATEGY_FALLBACK
    }
}

#[cfg(not(all(target_os = "linux", feature = "fast-barrier", not(miri))))]
fn pick_strategy() -> u8 {
    STRATEGY_FALLBACK
}

#[cfg(all(target_os = "linux", feature = "fast-barrier", not(miri)))]
mod sys {
    use once_cell::race::OnceBox;
    use parking_lot::Mutex;

    // The libc crate does not expose the membarrier command set; numbers
    // are from include/uapi/linux/membarrier.h.
    const MEMBARRIER_CMD_QUERY: libc::c_int = 0;
    const MEMBARRIER_CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;
    const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

    fn sys_membarrier(cmd: libc::c_int) -> libc::c_long {
        unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0 as libc::c_int) }
    }

    pub(super) fn membarrier_supported() -> bool {
        let ret = sys_membarrier(MEMBARRIER_CMD_QUERY);
        if ret < 0
            || ret & MEMBARRIER_CMD_PRIVATE_EXPEDITED as libc::c_long == 0
            || ret & MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED as libc::c_long == 0
        {
            return false;
        }
        // Registration must precede the first expedited barrier.
        sys_membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED) >= 0
    }

    #[inline]
    pub(super) fn membarrier_barrier() {
        if sys_membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED) < 0 {
            crate::die("membarrier(PRIVATE_EXPEDITED) failed after successful registration");
        }
    }

    /// Process-wide barrier for kernels without expedited membarrier:
    /// flipping a dirty page's protection to PROT_NONE forces a TLB
    /// shootdown IPI, which fully fences every CPU running this process.
    struct PageBarrier {
        lock: Mutex<()>,
        page: usize,
        page_size: usize,
    }

    impl PageBarrier {
        fn new() -> Self {
            unsafe {
                let page_size = libc::sysconf(libc::_SC_PAGESIZE);
                if page_size <= 0 {
                    crate::die("sysconf(_SC_PAGESIZE) failed");
                }
                let page_size = page_size as usize;
                let page = libc::mmap(
                    core::ptr::null_mut(),
                    page_size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if page == libc::MAP_FAILED {
                    crate::die("mmap for mprotect barrier failed");
                }
                // Keep the page resident: if it were paged out between the
                // two mprotect calls, no IPI would be generated.
                libc::mlock(page, page_size);
                Self {
                    lock: Mutex::new(()),
                    page: page as usize,
                    page_size,
                }
            }
        }

        fn issue(&self) {
            let _guard = self.lock.lock();
            let page = self.page as *mut libc::c_void;
            unsafe {
                if libc::mprotect(page, self.page_size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                    crate::die("mprotect(PROT_READ|PROT_WRITE) failed");
                }
                // Dirty the page so the kernel cannot elide the TLB flush.
                let word = &*(page as *const core::sync::atomic::AtomicUsize);
                word.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
                if libc::mprotect(page, self.page_size, libc::PROT_NONE) != 0 {
                    crate::die("mprotect(PROT_NONE) failed");
                }
            }
        }
    }

    static PAGE_BARRIER: OnceBox<PageBarrier> = OnceBox::new();

    #[inline]
    pub(super) fn mprotect_barrier() {
        PAGE_BARRIER
            .get_or_init(|| Box::new(PageBarrier::new()))
            .issue();
    }
}
