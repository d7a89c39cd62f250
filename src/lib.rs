//! Nazar: safe memory reclamation for concurrent data structures.
//!
//! Two tightly related read-side primitives let a thread dereference a
//! published pointer and keep the pointee alive for a bounded critical
//! section:
//!
//! - **Hazard-pointer protected reference counts** ([`hazard`]): a
//!   per-CPU hazard slot pins the object for the dereference window and
//!   promotes to a per-object refcount for long critical sections or when
//!   the slot bank runs dry. Writers retire with unpublish +
//!   [`synchronize`] + reference drop.
//! - **QSBR RCU** ([`qsbr`]): registered reader threads report quiescent
//!   states; writers wait out a grace period per domain, with concurrent
//!   `synchronize` calls batched behind a single leader and a
//!   futex-backed slow path.
//!
//! Readers pair compiler-only fences with the writer's process-wide
//! broadcast barrier (`sys_membarrier` where available), so the read-side
//! fast paths stay free of full fences.
//!
//! # Example
//!
//! ```
//! use nazar::{hp_get, synchronize_put, HazardCell, HazardCtx, HazardNode};
//!
//! #[repr(C)]
//! struct Config {
//!     node: HazardNode,
//!     max_conns: u32,
//! }
//!
//! unsafe fn release(node: *mut HazardNode) {
//!     drop(unsafe { Box::from_raw(node as *mut Config) });
//! }
//!
//! static CURRENT: HazardCell = HazardCell::new();
//!
//! let cfg = Box::into_raw(Box::new(Config {
//!     node: HazardNode::new(release),
//!     max_conns: 128,
//! }));
//! unsafe { CURRENT.set(cfg as *mut HazardNode) };
//!
//! // Reader: pin, use, unpin.
//! let mut ctx = HazardCtx::new();
//! if hp_get(&CURRENT, &mut ctx) {
//!     let cfg = ctx.node() as *const Config;
//!     assert_eq!(unsafe { (*cfg).max_conns }, 128);
//! }
//! drop(ctx);
//!
//! // Writer: unpublish, wait out readers, drop the owner reference.
//! unsafe { CURRENT.set(std::ptr::null_mut()) };
//! unsafe { synchronize_put(cfg as *mut HazardNode) };
//! ```

#![warn(missing_docs)]

mod barrier;
mod cpu;
mod futex;
pub mod hazard;
pub mod qsbr;
mod refcount;
mod slots;
mod ttas;
mod wait_queue;

pub use hazard::{
    hp_get, hp_put, node_put, promote_to_ref, ref_get, synchronize, synchronize_put, HazardCell,
    HazardCtx, HazardNode, ProtectMode, ReleaseFn,
};
pub use qsbr::{
    main_domain, rcu_quiescent_state, rcu_read_lock, rcu_read_ongoing, rcu_read_unlock,
    rcu_register_thread, rcu_thread_offline, rcu_thread_online, rcu_unregister_thread,
    synchronize_rcu, RcuDomain, ReaderTls,
};
pub use refcount::RefCount;

/// Unrecoverable platform failure: log and abort, never unwind.
pub(crate) fn die(msg: &str) -> ! {
    log::error!("nazar: fatal: {msg}");
    std::process::abort();
}
