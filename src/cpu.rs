//! Current-CPU identification and possible-CPU count.
//!
//! The possible-CPU count must include offline processors: `getcpu()` can
//! return any configured CPU number, and the hazard slab is indexed by it.

use core::sync::atomic::{AtomicUsize, Ordering};

static NUM_POSSIBLE_CPUS: AtomicUsize = AtomicUsize::new(0);

/// Number of configured (possible, not merely online) CPUs, cached after
/// the first query.
pub(crate) fn num_possible_cpus() -> usize {
    let cached = NUM_POSSIBLE_CPUS.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    query_num_possible_cpus()
}

#[cold]
fn query_num_possible_cpus() -> usize {
    #[cfg(all(unix, not(miri)))]
    let n = {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if n > 0 { n as usize } else { 1 }
    };
    #[cfg(not(all(unix, not(miri))))]
    let n = std::thread::available_parallelism().map_or(1, |p| p.get());

    NUM_POSSIBLE_CPUS.store(n, Ordering::Relaxed);
    n
}

/// Identifier of the CPU the calling thread runs on.
///
/// May be stale by the time the caller acts on it; the slot claim protocol
/// re-validates it and reports migration to the caller.
#[cfg(all(target_os = "linux", not(miri)))]
#[inline]
pub(crate) fn current_cpu() -> u32 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        // getcpu is best-effort on exotic configurations; degrade to a
        // fixed home CPU rather than fail the read side.
        return 0;
    }
    cpu as u32
}

/// Off-CPU fallback: stripe threads over the banks by registration order.
/// The id is stable for the thread's lifetime, which is all the slot claim
/// protocol needs (a "CPU" here is merely a bank index).
#[cfg(not(all(target_os = "linux", not(miri))))]
#[inline]
pub(crate) fn current_cpu() -> u32 {
    use core::sync::atomic::AtomicU32;
    static NEXT: AtomicU32 = AtomicU32::new(0);
    thread_local! {
        static HOME: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    HOME.with(|h| *h % num_possible_cpus() as u32)
}
