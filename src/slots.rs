//! Per-CPU hazard slot banks.
//!
//! Each possible CPU owns one cache-line-padded bank of `NR_SLOTS` slots.
//! A slot holds either 0 (empty) or a period-tagged node pointer (low bit
//! is the period). The last slot of every bank is the emergency slot,
//! reserved as a transient staging area for readers that find every other
//! slot occupied; its occupant promotes to a reference count immediately,
//! so waiting on it is bounded.
//!
//! Ownership rule: a slot is armed (0 -> tagged) only through the claim
//! protocol below, which re-validates the claimant's CPU; any thread may
//! clear a slot or observe it.

use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use once_cell::race::OnceBox;

use crate::cpu;

#[cfg(feature = "slots-32")]
pub(crate) const NR_SLOTS: usize = 32;
#[cfg(all(feature = "slots-16", not(feature = "slots-32")))]
pub(crate) const NR_SLOTS: usize = 16;
#[cfg(not(any(feature = "slots-16", feature = "slots-32")))]
pub(crate) const NR_SLOTS: usize = 8;

pub(crate) const EMERGENCY_SLOT: usize = NR_SLOTS - 1;

/// Outcome of a restartable slot claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The slot now holds the caller's tagged pointer.
    Claimed,
    /// The slot is occupied; try the next one.
    Busy,
    /// The caller no longer runs on the CPU it targeted; re-read the CPU
    /// and re-home before retrying.
    Migrated,
}

/// One hazard pointer cell.
pub(crate) struct Slot {
    value: AtomicUsize,
}

impl Slot {
    const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> usize {
        self.value.load(order)
    }

    #[inline]
    pub(crate) fn clear(&self, order: Ordering) {
        self.value.store(0, order);
    }

    /// Restartable compare-store: arm the slot with `tagged` if it is
    /// empty and the caller still runs on `cpu`.
    ///
    /// The store itself is relaxed; the reader fence that follows a
    /// successful claim (paired with the writer's broadcast barrier)
    /// provides the ordering. A claim that lands after a migration is
    /// still safe -- every bank is scanned during synchronize -- it only
    /// costs slot locality, which is why migration is reported instead of
    /// silently tolerated.
    #[inline]
    pub(crate) fn try_claim(&self, tagged: usize, cpu: u32) -> Claim {
        if cpu::current_cpu() != cpu {
            return Claim::Migrated;
        }
        match self
            .value
            .compare_exchange(0, tagged, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => Claim::Claimed,
            Err(_) => Claim::Busy,
        }
    }
}

/// One CPU's bank of hazard slots.
pub(crate) struct HazardBank {
    pub(crate) slots: [Slot; NR_SLOTS],
}

impl HazardBank {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::new()),
        }
    }
}

struct HazardSlab {
    banks: Box<[CachePadded<HazardBank>]>,
}

static SLAB: OnceBox<HazardSlab> = OnceBox::new();

/// The process-wide hazard slab, one bank per possible CPU. Built once on
/// first use and never torn down.
#[inline]
pub(crate) fn slab() -> &'static [CachePadded<HazardBank>] {
    &SLAB
        .get_or_init(|| {
            let banks = (0..cpu::num_possible_cpus())
                .map(|_| CachePadded::new(HazardBank::new()))
                .collect();
            Box::new(HazardSlab { banks })
        })
        .banks
}
