//! # Sync Slot Pool
//!
//! Fixed set of completion slots handed to synchronous pushes.
//!
//! All slots are allocated when the queue is built. A producer claims a
//! slot, attaches its index to the command, then blocks on the slot's
//! semaphore until the consumer posts it.

use std::sync::atomic::{AtomicBool, Ordering};

use super::Semaphore;

/// One completion slot.
#[derive(Debug, Default)]
struct SyncSlot {
    semaphore: Semaphore,
    /// Only flipped while the owning queue's lock is held.
    in_use: AtomicBool,
}

/// Pre-allocated pool of sync slots.
///
/// # Thread Safety
///
/// `try_acquire` and `release` must be called with the owning queue's lock
/// held. `post` and `wait` touch only the slot's own semaphore.
#[derive(Debug)]
pub(crate) struct SyncSlotPool {
    slots: Box<[SyncSlot]>,
}

impl SyncSlotPool {
    /// Creates a pool of `count` free slots.
    pub(crate) fn new(count: usize) -> Self {
        assert!(count > 0, "sync slot pool must hold at least one slot");
        Self {
            slots: (0..count).map(|_| SyncSlot::default()).collect(),
        }
    }

    /// Number of slots.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Claims the first free slot.
    pub(crate) fn try_acquire(&self) -> Option<u32> {
        let index = self
            .slots
            .iter()
            .position(|slot| !slot.in_use.load(Ordering::Relaxed))?;
        self.slots[index].in_use.store(true, Ordering::Relaxed);
        u32::try_from(index).ok()
    }

    /// Marks `slot` free again.
    pub(crate) fn release(&self, slot: u32) {
        let slot = &self.slots[slot as usize];
        debug_assert!(slot.in_use.load(Ordering::Relaxed));
        slot.in_use.store(false, Ordering::Relaxed);
    }

    /// Signals completion to the producer waiting on `slot`.
    #[inline]
    pub(crate) fn post(&self, slot: u32) {
        self.slots[slot as usize].semaphore.post();
    }

    /// Blocks until `slot` is posted.
    #[inline]
    pub(crate) fn wait(&self, slot: u32) {
        self.slots[slot as usize].semaphore.wait();
    }

    /// Slots currently claimed.
    pub(crate) fn in_use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_use.load(Ordering::Relaxed))
            .count()
    }
}
