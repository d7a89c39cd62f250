//! Quiescent-state-based RCU with per-domain grace periods.
//!
//! Readers are registered threads that periodically announce a quiescent
//! state by copying the domain's grace-period counter into their own; a
//! reader whose counter is zero is offline. `read_lock`/`read_unlock`
//! cost nothing in this flavor -- the reader's contract is carried
//! entirely by the online/quiescent protocol.
//!
//! Writers serialize grace periods per domain behind `gp_lock`, batch
//! concurrent `synchronize` calls through a waiter queue, and classify
//! readers around a dual-phase counter advance. The registry lock is
//! released sporadically while waiting so registration keeps making
//! progress, and a futex takes over from spinning after
//! `RCU_QS_ACTIVE_ATTEMPTS` polls.

use std::mem;
use std::sync::atomic::{compiler_fence, fence, AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use once_cell::race::OnceBox;
use parking_lot::{Mutex, MutexGuard};

use crate::barrier;
use crate::futex;
use crate::wait_queue::{WaitNode, WaitQueue};

/// Low bit of the grace-period counter: set while the domain exists, so
/// an online reader's counter copy is never zero (zero means offline).
const RCU_GP_ONLINE: usize = 1 << 0;

/// Counter stride per grace-period phase. Advancing by it both moves the
/// counter strictly forward and toggles bit 1, which is what the
/// dual-phase reader classification keys on.
const RCU_GP_CTR: usize = 1 << 1;

/// Polls of the registry before arming the futex and parking.
const RCU_QS_ACTIVE_ATTEMPTS: u32 = 100;

/// Per-domain grace-period word: the counter readers copy, and the futex
/// writers park on.
struct RcuGp {
    ctr: AtomicUsize,
    futex: AtomicI32,
}

/// Where a reader stands relative to the current grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Online and has observed the current counter: quiescent-safe.
    ActiveCurrent,
    /// Online but still carrying an older counter: must be waited for.
    ActiveOld,
    /// Offline.
    Inactive,
}

/// Per-reader record shared between the reader thread and writers.
///
/// Created once per thread per domain, registered with
/// [`RcuDomain::register_thread`], and dropped after unregistration.
pub struct ReaderTls {
    /// Nonzero while online; equals the domain counter copy last observed
    /// at a quiescent point.
    ctr: AtomicUsize,
    /// Set by a parking writer; tells the reader its next quiescent state
    /// must wake the grace period.
    waiting: AtomicBool,
    /// Tracks registry membership, for misuse checks.
    registered: AtomicBool,
}

impl ReaderTls {
    /// A fresh, unregistered, offline reader record.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ctr: AtomicUsize::new(0),
            waiting: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        })
    }
}

impl Drop for ReaderTls {
    fn drop(&mut self) {
        debug_assert!(
            !self.registered.load(Ordering::Relaxed),
            "reader record dropped while still registered"
        );
    }
}

struct Registry {
    readers: Vec<Arc<ReaderTls>>,
}

/// An independent RCU namespace: grace periods of two domains do not
/// serialize with each other.
pub struct RcuDomain {
    gp: CachePadded<RcuGp>,
    /// Serializes grace periods within the domain.
    gp_lock: Mutex<()>,
    /// Protects the reader registry. Not held across the whole grace
    /// period: `wait_for_readers` releases it between iterations so
    /// registration can make progress.
    registry: Mutex<Registry>,
    gp_waiters: WaitQueue,
}

impl RcuDomain {
    /// A new domain with an empty registry.
    pub fn new() -> Self {
        Self {
            gp: CachePadded::new(RcuGp {
                ctr: AtomicUsize::new(RCU_GP_ONLINE),
                futex: AtomicI32::new(0),
            }),
            gp_lock: Mutex::new(()),
            registry: Mutex::new(Registry {
                readers: Vec::new(),
            }),
            gp_waiters: WaitQueue::new(),
        }
    }

    /// Add `tls` to this domain's registry and bring it online.
    ///
    /// The record must be unregistered and offline.
    pub fn register_thread(&self, tls: &Arc<ReaderTls>) {
        debug_assert_eq!(tls.ctr.load(Ordering::Relaxed), 0);
        {
            let mut reg = self.registry.lock();
            debug_assert!(!tls.registered.load(Ordering::Relaxed));
            tls.registered.store(true, Ordering::Relaxed);
            reg.readers.push(tls.clone());
        }
        self.thread_online(tls);
    }

    /// Take `tls` offline and remove it from the registry.
    ///
    /// Going offline first is what keeps this from deadlocking against a
    /// writer already waiting on us.
    pub fn unregister_thread(&self, tls: &Arc<ReaderTls>) {
        self.thread_offline(tls);
        debug_assert!(tls.registered.load(Ordering::Relaxed));
        tls.registered.store(false, Ordering::Relaxed);
        let mut reg = self.registry.lock();
        reg.readers.retain(|r| !Arc::ptr_eq(r, tls));
        // If a grace period is mid-flight, the record may live in the
        // leader's working lists instead; the splice at the end of the
        // grace period drops unregistered records.
    }

    /// Enter a read-side critical section. Free in QSBR: the thread must
    /// simply be online.
    #[inline]
    pub fn read_lock(&self, tls: &ReaderTls) {
        debug_assert_ne!(
            tls.ctr.load(Ordering::Relaxed),
            0,
            "read_lock on an offline reader"
        );
    }

    /// Leave a read-side critical section. Free in QSBR.
    #[inline]
    pub fn read_unlock(&self, tls: &ReaderTls) {
        debug_assert_ne!(
            tls.ctr.load(Ordering::Relaxed),
            0,
            "read_unlock on an offline reader"
        );
    }

    /// Whether the thread is online (inside its read-side participation
    /// window).
    #[inline]
    pub fn read_ongoing(&self, tls: &ReaderTls) -> bool {
        tls.ctr.load(Ordering::Relaxed) != 0
    }

    /// Announce a quiescent state: no read-side references are held at
    /// this point in the thread's execution.
    ///
    /// Skips all fences when the thread already observed the current
    /// counter -- there is nothing new to report.
    #[inline]
    pub fn quiescent_state(&self, tls: &ReaderTls) {
        debug_assert!(tls.registered.load(Ordering::Relaxed));
        let gp_ctr = self.gp.ctr.load(Ordering::Relaxed);
        if gp_ctr == tls.ctr.load(Ordering::Relaxed) {
            return;
        }
        fence(Ordering::SeqCst);
        tls.ctr.store(gp_ctr, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.wake_up_gp(tls);
        fence(Ordering::SeqCst);
    }

    /// Take the thread offline: an extended quiescent state during which
    /// it must not touch RCU-protected data.
    #[inline]
    pub fn thread_offline(&self, tls: &ReaderTls) {
        debug_assert!(tls.registered.load(Ordering::Relaxed));
        fence(Ordering::SeqCst);
        tls.ctr.store(0, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.wake_up_gp(tls);
        compiler_fence(Ordering::SeqCst);
    }

    /// Bring the thread back online, allowing read-side critical sections
    /// again.
    #[inline]
    pub fn thread_online(&self, tls: &ReaderTls) {
        debug_assert!(tls.registered.load(Ordering::Relaxed));
        compiler_fence(Ordering::SeqCst);
        tls.ctr
            .store(self.gp.ctr.load(Ordering::Relaxed), Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Reader half of the futex coordination: if a writer armed the
    /// futex and flagged us, disarm it and wake one waiter.
    #[inline]
    fn wake_up_gp(&self, tls: &ReaderTls) {
        if tls.waiting.load(Ordering::Relaxed) {
            tls.waiting.store(false, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if self
                .gp
                .futex
                .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                futex::wake(&self.gp.futex, 1);
            }
        }
    }

    fn reader_state(&self, tls: &ReaderTls) -> ReaderState {
        let v = tls.ctr.load(Ordering::Relaxed);
        if v == 0 {
            ReaderState::Inactive
        } else if v == self.gp.ctr.load(Ordering::Relaxed) {
            ReaderState::ActiveCurrent
        } else {
            ReaderState::ActiveOld
        }
    }

    /// Wait until a grace period elapses: every read-side critical
    /// section that began before this call has ended when it returns.
    ///
    /// A thread registered as a reader of this domain must pass its own
    /// record so it is not waited on (it is taken offline around the
    /// wait and brought back after). Pass `None` from threads that never
    /// registered with this domain.
    ///
    /// Blocking and non-cancellable. Concurrent callers are batched:
    /// one of them runs the grace period for everyone queued behind it.
    pub fn synchronize(&self, reader: Option<&ReaderTls>) {
        let was_online = reader.is_some_and(|tls| self.read_ongoing(tls));

        // Never wait on ourselves; also orders our prior stores before
        // the grace period for the offline-writer case.
        match reader {
            Some(tls) if was_online => self.thread_offline(tls),
            _ => fence(Ordering::SeqCst),
        }

        let wait = WaitNode::new();
        // SAFETY: the node stays on this frame until busy_wait returns
        // (follower) or until we wake the batch that contains it
        // (leader); wake_all skips RUNNING nodes and finishes the
        // teardown handshake before we return.
        if unsafe { self.gp_waiters.add(&wait) } {
            // Not first in queue: the leader runs the grace period and
            // wakes us after it completes.
            wait.busy_wait();
        } else {
            wait.set_running();
            self.run_grace_period();
        }

        match reader {
            Some(tls) if was_online => self.thread_online(tls),
            _ => fence(Ordering::SeqCst),
        }
    }

    /// Leader path: performs one grace period covering every waiter
    /// queued so far, then wakes them.
    fn run_grace_period(&self) {
        let _gp = self.gp_lock.lock();

        // Claim the whole batch; later arrivals elect the next leader.
        let waiters = self.gp_waiters.take_all();

        let mut guard = Some(self.registry.lock());
        let has_readers = guard
            .as_ref()
            .is_some_and(|reg| !reg.readers.is_empty());
        if has_readers {
            // Callers' unpublish stores must be visible before we read
            // reader counters.
            barrier::broadcast();

            let mut input = {
                let reg = guard.as_mut().expect("registry lock held");
                mem::take(&mut reg.readers)
            };
            let mut cur_snap: Vec<Arc<ReaderTls>> = Vec::new();
            let mut qs: Vec<Arc<ReaderTls>> = Vec::with_capacity(input.len());

            // Phase one: wait for readers to observe the original
            // counter or go quiescent.
            self.wait_for_readers(&mut guard, &mut input, Some(&mut cur_snap), &mut qs);
            debug_assert!(input.is_empty());

            // Phase-one waiting must complete before the counter
            // advance is committed, and the advance must be committed
            // before phase-two waiting starts; otherwise a steady stream
            // of readers could starve the writer.
            fence(Ordering::SeqCst);
            let ctr = self.gp.ctr.load(Ordering::Relaxed);
            self.gp
                .ctr
                .store(ctr.wrapping_add(RCU_GP_CTR), Ordering::Relaxed);
            fence(Ordering::SeqCst);

            // Phase two: the snapshot readers now carry an old counter;
            // wait them out.
            self.wait_for_readers(&mut guard, &mut cur_snap, None, &mut qs);
            debug_assert!(cur_snap.is_empty());

            // Splice the quiescent readers back, dropping any that
            // unregistered while we held them and keeping registrants
            // that re-registered mid-flight unique.
            let reg = guard.as_mut().expect("registry lock held");
            for tls in qs {
                if tls.registered.load(Ordering::Relaxed)
                    && !reg.readers.iter().any(|r| Arc::ptr_eq(r, &tls))
                {
                    reg.readers.push(tls);
                }
            }
        }

        drop(guard);
        drop(_gp);

        // Wake the batch only after the grace period and its closing
        // fences are done.
        // SAFETY: every queued waiter is parked in busy_wait on a live
        // stack frame until we complete its teardown handshake.
        unsafe { waiters.wake_all() };
    }

    /// Classify `input` readers until none remain old, releasing the
    /// registry lock between iterations and parking on the futex after
    /// the active-poll budget runs out.
    fn wait_for_readers<'a>(
        &'a self,
        guard: &mut Option<MutexGuard<'a, Registry>>,
        input: &mut Vec<Arc<ReaderTls>>,
        mut cur_snap: Option<&mut Vec<Arc<ReaderTls>>>,
        qs: &mut Vec<Arc<ReaderTls>>,
    ) {
        let mut wait_loops: u32 = 0;
        loop {
            if wait_loops < RCU_QS_ACTIVE_ATTEMPTS {
                wait_loops += 1;
            }
            let armed = wait_loops >= RCU_QS_ACTIVE_ATTEMPTS;
            if armed {
                self.gp.futex.store(-1, Ordering::Relaxed);
                // Futex write before waiting flags; readers read them in
                // the opposite order.
                fence(Ordering::SeqCst);
                for tls in input.iter() {
                    tls.waiting.store(true, Ordering::Relaxed);
                }
                // Flag writes before counter reads.
                fence(Ordering::SeqCst);
            }

            let mut still_old = Vec::with_capacity(input.len());
            for tls in input.drain(..) {
                match self.reader_state(&tls) {
                    ReaderState::ActiveCurrent => match cur_snap.as_deref_mut() {
                        Some(snap) => snap.push(tls),
                        None => qs.push(tls),
                    },
                    ReaderState::Inactive => qs.push(tls),
                    // Old snapshot: keep it in the input list and poll
                    // until it reports quiescence or goes offline.
                    ReaderState::ActiveOld => still_old.push(tls),
                }
            }
            *input = still_old;

            if input.is_empty() {
                if armed {
                    // Counter reads before futex disarm.
                    fence(Ordering::SeqCst);
                    self.gp.futex.store(0, Ordering::Relaxed);
                }
                return;
            }

            // Release the registry lock so registration and
            // unregistration make progress while we wait.
            *guard = None;
            if armed {
                self.wait_gp();
            } else {
                core::hint::spin_loop();
            }
            *guard = Some(self.registry.lock());
        }
    }

    fn wait_gp(&self) {
        // Reader counters before the futex word.
        fence(Ordering::SeqCst);
        if self.gp.futex.load(Ordering::Relaxed) != -1 {
            return;
        }
        futex::wait(&self.gp.futex, -1);
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RcuDomain {
    fn drop(&mut self) {
        let reg = self.registry.lock();
        if !reg.readers.is_empty() {
            crate::die("RCU domain destroyed with readers still registered");
        }
    }
}

// --- Process-wide main domain -------------------------------------------

static MAIN_DOMAIN: OnceBox<RcuDomain> = OnceBox::new();

/// The process-wide domain behind the `rcu_*` convenience calls.
pub fn main_domain() -> &'static RcuDomain {
    MAIN_DOMAIN.get_or_init(|| Box::new(RcuDomain::new()))
}

thread_local! {
    static MAIN_TLS: core::cell::RefCell<Option<Arc<ReaderTls>>> =
        const { core::cell::RefCell::new(None) };
}

fn with_main_tls(f: impl FnOnce(&Arc<ReaderTls>)) {
    MAIN_TLS.with(|slot| {
        let tls = slot.borrow();
        match tls.as_ref() {
            Some(tls) => f(tls),
            None => debug_assert!(false, "calling thread is not an RCU reader"),
        }
    });
}

/// Register the calling thread as a reader of the main domain.
pub fn rcu_register_thread() {
    let tls = ReaderTls::new();
    main_domain().register_thread(&tls);
    MAIN_TLS.with(|slot| {
        let prev = slot.borrow_mut().replace(tls);
        debug_assert!(prev.is_none(), "thread registered twice");
    });
}

/// Unregister the calling thread from the main domain.
pub fn rcu_unregister_thread() {
    let tls = MAIN_TLS.with(|slot| slot.borrow_mut().take());
    match tls {
        Some(tls) => main_domain().unregister_thread(&tls),
        None => debug_assert!(false, "unregistering a thread that never registered"),
    }
}

/// Main-domain [`RcuDomain::read_lock`].
pub fn rcu_read_lock() {
    with_main_tls(|tls| main_domain().read_lock(tls));
}

/// Main-domain [`RcuDomain::read_unlock`].
pub fn rcu_read_unlock() {
    with_main_tls(|tls| main_domain().read_unlock(tls));
}

/// Main-domain [`RcuDomain::read_ongoing`]; `false` for unregistered
/// threads.
pub fn rcu_read_ongoing() -> bool {
    MAIN_TLS.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|tls| main_domain().read_ongoing(tls))
    })
}

/// Main-domain [`RcuDomain::quiescent_state`].
pub fn rcu_quiescent_state() {
    with_main_tls(|tls| main_domain().quiescent_state(tls));
}

/// Main-domain [`RcuDomain::thread_offline`].
pub fn rcu_thread_offline() {
    with_main_tls(|tls| main_domain().thread_offline(tls));
}

/// Main-domain [`RcuDomain::thread_online`].
pub fn rcu_thread_online() {
    with_main_tls(|tls| main_domain().thread_online(tls));
}

/// Main-domain [`RcuDomain::synchronize`]; uses the calling thread's
/// reader registration when it has one.
pub fn synchronize_rcu() {
    let tls = MAIN_TLS.with(|slot| slot.borrow().clone());
    main_domain().synchronize(tls.as_deref());
}
