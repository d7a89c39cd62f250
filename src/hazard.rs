//! Hazard-pointer protected reference counts.
//!
//! Dereferencing a published pointer is a two-step existence chain: a
//! per-CPU hazard slot pins the object for the (short) window it takes to
//! validate the publication, and long critical sections promote the pin to
//! a per-object reference count, freeing the slot. Writers retire an
//! object by unpublishing it, then [`synchronize`]-ing against readers'
//! slots, then dropping the owner reference.
//!
//! Slot stores on the read side pair with the writer's broadcast barrier
//! (see `barrier`), so the reader fast path carries no full fence when the
//! platform provides one.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::refcount::RefCount;
use crate::slots::{self, Claim, Slot, EMERGENCY_SLOT};
use crate::ttas::TTas;
use crate::{barrier, cpu};

/// Low bit of an armed slot: the period tag, which guarantees forward
/// progress of [`synchronize`]`(null)` against a steady stream of readers
/// re-arming the same slot with the same node.
const PERIOD_MASK: usize = 1;

static GLOBAL_PERIOD: AtomicUsize = AtomicUsize::new(0);

/// Serializes full-table synchronizes; the period flip is meaningless if
/// two of them interleave.
static SYNC_LOCK: TTas<()> = TTas::new(());

/// Type-erased release callback, invoked exactly once when an object's
/// reference count reaches zero, on the thread that observed the drop.
pub type ReleaseFn = unsafe fn(*mut HazardNode);

/// Reclamation header embedded in every protected object.
///
/// Embed it as the first field of a `#[repr(C)]` struct so the node
/// pointer and the object pointer coincide:
///
/// ```
/// use nazar::HazardNode;
///
/// #[repr(C)]
/// struct Conn {
///     node: HazardNode,
///     fd: i32,
/// }
///
/// unsafe fn release(node: *mut HazardNode) {
///     drop(unsafe { Box::from_raw(node as *mut Conn) });
/// }
///
/// let conn = Conn { node: HazardNode::new(release), fd: 3 };
/// # let _ = conn;
/// ```
pub struct HazardNode {
    refcount: RefCount,
    release: ReleaseFn,
}

impl HazardNode {
    /// A node holding its initial owner reference.
    pub fn new(release: ReleaseFn) -> Self {
        Self {
            refcount: RefCount::new(),
            release,
        }
    }

    /// The node's reference counter.
    pub fn refcount(&self) -> &RefCount {
        &self.refcount
    }
}

// An armed slot stores `node | period`, so nodes need an even address.
const _: () = assert!(core::mem::align_of::<HazardNode>() >= 2);

/// A publication point: one word that writers update with [`HazardCell::set`]
/// and readers dereference with [`hp_get`].
pub struct HazardCell {
    ptr: AtomicPtr<HazardNode>,
}

impl HazardCell {
    /// An empty (null) publication.
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish `node` (release order), or unpublish with null (relaxed:
    /// there is no pointee whose initialization needs ordering).
    ///
    /// # Safety
    ///
    /// A non-null `node` must point to a live `HazardNode` that stays
    /// live until the cell is unpublished and a subsequent
    /// [`synchronize`] for it completes.
    pub unsafe fn set(&self, node: *mut HazardNode) {
        if node.is_null() {
            self.ptr.store(node, Ordering::Relaxed);
        } else {
            self.ptr.store(node, Ordering::Release);
        }
    }
}

impl Default for HazardCell {
    fn default() -> Self {
        Self::new()
    }
}

/// How a [`HazardCtx`] currently pins its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectMode {
    /// Pinned by an armed hazard slot.
    Hazard,
    /// Pinned by a reference count; the slot has been released.
    Counted,
}

/// A reader's stack-scoped protection context.
///
/// Armed by a successful [`hp_get`]; disarmed by [`hp_put`] or by drop.
pub struct HazardCtx {
    slot: *const Slot,
    node: *mut HazardNode,
    mode: ProtectMode,
}

impl HazardCtx {
    /// An inert context, ready to be armed by [`hp_get`].
    pub const fn new() -> Self {
        Self {
            slot: ptr::null(),
            node: ptr::null_mut(),
            mode: ProtectMode::Hazard,
        }
    }

    /// The protected node, or null if the context is inert.
    #[inline]
    pub fn node(&self) -> *mut HazardNode {
        self.node
    }

    /// Current protection mode.
    #[inline]
    pub fn mode(&self) -> ProtectMode {
        self.mode
    }
}

impl Default for HazardCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardCtx {
    fn drop(&mut self) {
        hp_put(self);
    }
}

/// Dereference the cell's current publication.
///
/// Returns `false` with `ctx` left inert when the publication is null.
/// On `true`, `ctx` pins the published node: the object cannot be
/// released until the matching [`hp_put`].
///
/// Bounded on the read side: at most one emergency-slot wait (whose
/// occupant promotes immediately) and one publication re-load per
/// publication change observed.
pub fn hp_get(cell: &HazardCell, ctx: &mut HazardCtx) -> bool {
    let mut node = cell.ptr.load(Ordering::Relaxed);
    if node.is_null() {
        return false;
    }
    let slab = slots::slab();
    loop {
        let (slot, used_emergency) = claim_any_slot(slab, node);
        // Slot store before publication re-load; pairs with the
        // broadcast barrier in synchronize().
        barrier::reader_fence();
        let node2 = cell.ptr.load(Ordering::Acquire);
        if node2 != node {
            // The publication moved between our first load and the slot
            // store; the pinned value may already be retired. Both loads
            // are issued by this function, so the identity comparison
            // cannot be biased by a compile-time-known pointer.
            slot.clear(Ordering::Relaxed);
            if node2.is_null() {
                return false;
            }
            node = node2;
            continue;
        }
        ctx.slot = slot;
        ctx.node = node;
        ctx.mode = ProtectMode::Hazard;
        if used_emergency {
            // The emergency slot is a staging area only: hand the pin
            // over to the refcount right away so the slot frees up for
            // the next exhausted reader.
            promote_to_ref(ctx);
        }
        return true;
    }
}

/// Claim a slot in the caller's bank, falling back to the emergency slot
/// when the regular ones are all armed.
fn claim_any_slot(
    slab: &'static [crossbeam_utils::CachePadded<slots::HazardBank>],
    node: *mut HazardNode,
) -> (&'static Slot, bool) {
    let mut cpu_id = cpu::current_cpu();
    'rehome: loop {
        let bank = &slab[cpu_id as usize % slab.len()];
        let period = GLOBAL_PERIOD.load(Ordering::Relaxed);
        let tagged = node as usize | period;
        for slot in &bank.slots[..EMERGENCY_SLOT] {
            match slot.try_claim(tagged, cpu_id) {
                Claim::Claimed => return (slot, false),
                Claim::Busy => continue,
                Claim::Migrated => {
                    cpu_id = cpu::current_cpu();
                    continue 'rehome;
                }
            }
        }
        let emergency = &bank.slots[EMERGENCY_SLOT];
        loop {
            match emergency.try_claim(tagged, cpu_id) {
                Claim::Claimed => return (emergency, true),
                // The occupant promotes immediately, so this wait is
                // bounded by one promotion.
                Claim::Busy => core::hint::spin_loop(),
                Claim::Migrated => {
                    cpu_id = cpu::current_cpu();
                    continue 'rehome;
                }
            }
        }
    }
}

/// Trade the context's hazard slot for a reference count.
///
/// No-op when already counted. The refcount acquire precedes the slot
/// release: a synchronize that passes the freed slot must already observe
/// the non-zero count.
pub fn promote_to_ref(ctx: &mut HazardCtx) {
    if ctx.mode == ProtectMode::Counted {
        return;
    }
    debug_assert!(!ctx.node.is_null(), "promoting an inert context");
    unsafe {
        (*ctx.node).refcount.acquire();
        (*ctx.slot).clear(Ordering::Release);
    }
    ctx.slot = ptr::null();
    ctx.mode = ProtectMode::Counted;
}

/// End the critical section: release the hazard slot, or drop the
/// promoted reference (running the object's release at zero).
///
/// Safe to call on an inert context; leaves `ctx` inert.
pub fn hp_put(ctx: &mut HazardCtx) {
    match ctx.mode {
        ProtectMode::Hazard => {
            if !ctx.slot.is_null() {
                unsafe { (*ctx.slot).clear(Ordering::Release) };
            }
        }
        ProtectMode::Counted => unsafe { node_put(ctx.node) },
    }
    ctx.slot = ptr::null();
    ctx.node = ptr::null_mut();
    ctx.mode = ProtectMode::Hazard;
}

/// Dereference and immediately promote: returns an owned reference to the
/// published node, or null. The caller releases it with [`node_put`].
pub fn ref_get(cell: &HazardCell) -> *mut HazardNode {
    let mut ctx = HazardCtx::new();
    if !hp_get(cell, &mut ctx) {
        return ptr::null_mut();
    }
    promote_to_ref(&mut ctx);
    let node = ctx.node;
    // The reference now belongs to the caller, not the context.
    ctx.node = ptr::null_mut();
    ctx.mode = ProtectMode::Hazard;
    node
}

/// Drop a node reference; at zero, invoke its release callback.
///
/// Null is ignored.
///
/// # Safety
///
/// A non-null `node` must be live and the caller must own one of its
/// references.
pub unsafe fn node_put(node: *mut HazardNode) {
    if node.is_null() {
        return;
    }
    let n = unsafe { &*node };
    if n.refcount.release() {
        let release = n.release;
        unsafe { release(node) };
    }
}

/// Wait for hazard slots to stop covering `node` -- or, with a null
/// argument, for every in-flight hazard pointer.
///
/// With a specific node: after return, no thread holds a hazard pointer
/// to it that was obtained before the caller's last unpublish. The caller
/// must have unpublished the node first, or this can wait forever.
///
/// With null: after return, every slot has been observed empty or holding
/// a value that was not present when the call began. Serialized against
/// other null-mode calls.
pub fn synchronize(node: *const HazardNode) {
    if node.is_null() {
        synchronize_all();
        return;
    }
    // Unpublish before slot scan; pairs with readers' fence between
    // their slot store and publication re-load.
    barrier::broadcast();
    for bank in slots::slab() {
        for slot in &bank.slots {
            while (slot.load(Ordering::Acquire) & !PERIOD_MASK) == node as usize {
                core::hint::spin_loop();
            }
        }
    }
}

/// Dual-phase scan keyed on the period tag.
///
/// Each phase passes a slot that is empty, carries the phase's pass tag,
/// or changes from its initially observed value (a change implies the
/// original hazard was released). A slot held continuously across the
/// whole call carries some tag, and each tag value is trapped by one of
/// the two phases, so no pre-existing hazard survives. Liveness: in each
/// phase, readers arming fresh slots use the pass tag of that phase, so a
/// steady re-arming stream cannot stall the scan.
fn synchronize_all() {
    let _guard = SYNC_LOCK.lock();
    let period = GLOBAL_PERIOD.load(Ordering::Relaxed);
    barrier::broadcast();
    scan_pass(period);
    GLOBAL_PERIOD.store(period ^ 1, Ordering::Relaxed);
    barrier::broadcast();
    scan_pass(period ^ 1);
}

fn scan_pass(pass_period: usize) {
    for bank in slots::slab() {
        for slot in &bank.slots {
            let initial = slot.load(Ordering::Acquire);
            if initial == 0 || initial & PERIOD_MASK == pass_period {
                continue;
            }
            loop {
                core::hint::spin_loop();
                let v = slot.load(Ordering::Acquire);
                if v != initial {
                    break;
                }
            }
        }
    }
}

/// [`synchronize`] against `node`, then drop the owner reference.
///
/// The writer-side retirement idiom: unpublish, then `synchronize_put`.
///
/// # Safety
///
/// Same contract as [`node_put`]; additionally the node must already be
/// unpublished from every cell readers could fetch it from.
pub unsafe fn synchronize_put(node: *mut HazardNode) {
    synchronize(node);
    unsafe { node_put(node) };
}
