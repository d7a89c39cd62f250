//! Grace-period waiter queue.
//!
//! `synchronize` callers push a stack-allocated node onto a LIFO queue;
//! only the caller that found the queue empty performs the grace period,
//! and it wakes the whole batch afterwards. The teardown handshake lets
//! waiter nodes live on their owners' stacks: a waiter does not return
//! until the waker has set the TEARDOWN bit, after which the waker never
//! touches the node again.

use core::ptr;
use core::sync::atomic::{fence, AtomicI32, AtomicPtr, Ordering};

use crate::futex;

const WAITING: i32 = 0;
const WAKEUP: i32 = 1;
const RUNNING: i32 = 2;
const TEARDOWN: i32 = 4;

/// Spin attempts before parking on the futex.
const WAIT_ATTEMPTS: u32 = 1000;

/// A batch participant, owned by the waiting thread's stack frame.
pub(crate) struct WaitNode {
    state: AtomicI32,
    next: AtomicPtr<WaitNode>,
}

impl WaitNode {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicI32::new(WAITING),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Mark this node as the batch leader so `wake_all` skips it.
    pub(crate) fn set_running(&self) {
        self.state.store(RUNNING, Ordering::Relaxed);
    }

    /// Park until woken, then hold until the waker finishes the teardown
    /// handshake.
    pub(crate) fn busy_wait(&self) {
        let mut spins = 0u32;
        loop {
            if self.state.load(Ordering::Relaxed) != WAITING {
                break;
            }
            if spins < WAIT_ATTEMPTS {
                spins += 1;
                core::hint::spin_loop();
            } else {
                futex::wait(&self.state, WAITING);
            }
        }
        // The waker may still be between the wakeup store and the
        // futex call; it signals with TEARDOWN once it is done with us.
        while self.state.load(Ordering::Acquire) & TEARDOWN == 0 {
            core::hint::spin_loop();
        }
        debug_assert!(self.state.load(Ordering::Relaxed) & WAKEUP != 0);
    }
}

/// LIFO queue of pending grace-period waiters.
pub(crate) struct WaitQueue {
    head: AtomicPtr<WaitNode>,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push `node`; returns `true` if the queue was already non-empty
    /// (the caller is a follower, not the leader).
    ///
    /// # Safety
    ///
    /// `node` must stay valid until either `busy_wait` returns on it or,
    /// for the leader's own node, until the batch it joined is woken.
    pub(crate) unsafe fn add(&self, node: &WaitNode) -> bool {
        let node_ptr = node as *const WaitNode as *mut WaitNode;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            node.next.store(head, Ordering::Relaxed);
            // AcqRel: orders the pusher's prior accesses before the node
            // becomes reachable.
            match self
                .head
                .compare_exchange_weak(head, node_ptr, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return !head.is_null(),
                Err(h) => head = h,
            }
        }
    }

    /// Detach the entire queue; future pushers start a new batch.
    pub(crate) fn take_all(&self) -> Waiters {
        Waiters {
            head: self.head.swap(ptr::null_mut(), Ordering::AcqRel),
        }
    }
}

/// A detached batch of waiters.
pub(crate) struct Waiters {
    head: *mut WaitNode,
}

impl Waiters {
    /// Wake every parked waiter in the batch. Nodes marked RUNNING (the
    /// leader's own) are skipped.
    ///
    /// # Safety
    ///
    /// Nodes in the batch must still be valid; each node's owner is
    /// blocked in `busy_wait` (or is the caller itself).
    pub(crate) unsafe fn wake_all(self) {
        let mut cur = self.head;
        while !cur.is_null() {
            let node = unsafe { &*cur };
            // Read the link before waking: past TEARDOWN the owner may
            // pop its frame.
            let next = node.next.load(Ordering::Relaxed);
            if node.state.load(Ordering::Relaxed) & RUNNING == 0 {
                wake_one(node);
            }
            cur = next;
        }
    }
}

fn wake_one(node: &WaitNode) {
    // Grace-period completion must be visible before the wakeup.
    fence(Ordering::SeqCst);
    debug_assert_eq!(node.state.load(Ordering::Relaxed), WAITING);
    node.state.store(WAKEUP, Ordering::Release);
    futex::wake(&node.state, 1);
    node.state.fetch_or(TEARDOWN, Ordering::Release);
}
