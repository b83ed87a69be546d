//! # Command Arena
//!
//! Fixed-size, 8-byte aligned byte buffer backing the command queue ring.
//!
//! The arena only knows about record headers. Cursor bookkeeping (write,
//! read and dealloc offsets) lives in the queue, which serializes every
//! access under its mutex.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::{self, NonNull};

use crate::config::RECORD_ALIGN;
use crate::error::{CoreError, CoreResult};
use crate::memory::alloc;

/// Bytes reserved for a record header: a `u32` padded to the record
/// alignment so the body that follows stays aligned.
pub(crate) const RECORD_HEADER_SIZE: usize = RECORD_ALIGN;

/// Header value marking "wrap to offset 0".
pub(crate) const WRAP_SENTINEL: u32 = 0;

/// Low header bit: the record's command has not finished running.
pub(crate) const IN_USE_BIT: u32 = 1;

/// Encodes a live record header for a body of `body_size` bytes.
#[inline]
pub(crate) fn live_header(body_size: usize) -> u32 {
    debug_assert!(body_size > 0 && body_size % RECORD_ALIGN == 0);
    let size = u32::try_from(body_size).unwrap_or(u32::MAX >> 1);
    (size << 1) | IN_USE_BIT
}

/// Body size encoded in a header.
#[inline]
pub(crate) const fn body_size(header: u32) -> usize {
    (header >> 1) as usize
}

/// The raw ring storage.
pub(crate) struct CommandArena {
    base: NonNull<u8>,
    capacity: usize,
}

impl CommandArena {
    /// Allocates an arena of `capacity` bytes.
    pub(crate) fn new(capacity: usize) -> CoreResult<Self> {
        let layout = Layout::from_size_align(capacity, RECORD_ALIGN)
            .map_err(|e| CoreError::InvalidConfig(format!("arena layout: {e}")))?;
        let base = alloc::allocate(layout).ok_or(CoreError::OutOfMemory {
            requested: capacity,
        })?;
        Ok(Self { base, capacity })
    }

    /// Total size in bytes.
    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reads the header at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be record-aligned, inside the arena, and hold a header
    /// written by [`write_header`](Self::write_header). The caller must hold
    /// the queue lock.
    #[inline]
    pub(crate) unsafe fn read_header(&self, offset: usize) -> u32 {
        debug_assert!(offset % RECORD_ALIGN == 0 && offset + RECORD_HEADER_SIZE <= self.capacity);
        // SAFETY: in bounds and aligned per the caller's contract.
        unsafe { ptr::read(self.base.as_ptr().add(offset).cast::<u32>()) }
    }

    /// Writes the header at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be record-aligned with room for a header, and the caller
    /// must hold the queue lock.
    #[inline]
    pub(crate) unsafe fn write_header(&self, offset: usize, header: u32) {
        debug_assert!(offset % RECORD_ALIGN == 0 && offset + RECORD_HEADER_SIZE <= self.capacity);
        // SAFETY: in bounds and aligned per the caller's contract.
        unsafe { ptr::write(self.base.as_ptr().add(offset).cast::<u32>(), header) };
    }

    /// Pointer to the body of the record starting at `offset`.
    #[inline]
    pub(crate) fn body_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset + RECORD_HEADER_SIZE <= self.capacity);
        self.base
            .as_ptr()
            .wrapping_add(offset + RECORD_HEADER_SIZE)
    }
}

impl Drop for CommandArena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe {
            alloc::deallocate(
                self.base,
                Layout::from_size_align_unchecked(self.capacity, RECORD_ALIGN),
            );
        }
    }
}
