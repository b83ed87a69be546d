//! # Allocator Facade
//!
//! Thin layer over `std::alloc` used by every raw allocation in the core
//! (COW storage blocks, the command arena). It reports failure as `None`
//! instead of aborting so callers can surface `OutOfMemory`, and keeps
//! process-wide counters for leak checks and profiling.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_BLOCKS: AtomicUsize = AtomicUsize::new(0);
static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);
static TOTAL_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of the process-wide allocation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Blocks currently allocated through the facade.
    pub live_blocks: usize,
    /// Bytes currently allocated through the facade.
    pub live_bytes: usize,
    /// Allocations performed since process start (reallocations included).
    pub total_allocations: usize,
}

/// Returns the current allocation counters.
#[must_use]
pub fn stats() -> AllocStats {
    AllocStats {
        live_blocks: LIVE_BLOCKS.load(Ordering::Relaxed),
        live_bytes: LIVE_BYTES.load(Ordering::Relaxed),
        total_allocations: TOTAL_ALLOCATIONS.load(Ordering::Relaxed),
    }
}

/// Allocates a block for `layout`. Returns `None` if the allocator refuses.
///
/// # Panics
///
/// Panics if `layout` has zero size.
#[must_use]
pub fn allocate(layout: Layout) -> Option<NonNull<u8>> {
    assert!(layout.size() > 0, "zero-size allocation through the facade");

    // SAFETY: layout has non-zero size (checked above).
    let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;

    LIVE_BLOCKS.fetch_add(1, Ordering::Relaxed);
    LIVE_BYTES.fetch_add(layout.size(), Ordering::Relaxed);
    TOTAL_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    Some(ptr)
}

/// Resizes a block. On failure the old block is untouched and still owned by
/// the caller.
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] or [`reallocate`] with
/// `old_layout`, and `new_size` must be non-zero and must not overflow
/// `isize` when rounded up to `old_layout.align()`.
#[must_use]
pub unsafe fn reallocate(
    ptr: NonNull<u8>,
    old_layout: Layout,
    new_size: usize,
) -> Option<NonNull<u8>> {
    debug_assert!(new_size > 0);

    // SAFETY: forwarded from the caller's contract.
    let new_ptr = NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), old_layout, new_size) })?;

    LIVE_BYTES.fetch_add(new_size, Ordering::Relaxed);
    LIVE_BYTES.fetch_sub(old_layout.size(), Ordering::Relaxed);
    TOTAL_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    Some(new_ptr)
}

/// Frees a block.
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] or [`reallocate`] with
/// `layout`, and must not be used afterwards.
pub unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
    // SAFETY: forwarded from the caller's contract.
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };

    LIVE_BLOCKS.fetch_sub(1, Ordering::Relaxed);
    LIVE_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
}
