//! # Copy-on-Write Storage
//!
//! Reference-counted element storage shared between handles until one of
//! them mutates.
//!
//! This module manages raw storage blocks and therefore uses unsafe code.
//! Every unsafe block states the invariant it relies on.

#![allow(unsafe_code)]
//!
//! ## Block Layout
//!
//! ```text
//!   [padding][refcount: u32][size: u32][elem 0][elem 1] ... [elem N-1]
//!                                      ^
//!                                      handle points here
//! ```
//!
//! The payload is sized to `next_power_of_two(size * size_of::<T>())`, so the
//! block layout is always derivable from `size` alone. Padding only exists
//! for elements aligned above 8 bytes.
//!
//! ## Sharing Rules
//!
//! - Copying a handle bumps the refcount. No element is touched.
//! - Any mutating call first forks the block if the refcount is above 1.
//! - The last handle to drop runs element destructors and frees the block.
//! - An empty container never owns a block.

use std::alloc::{handle_alloc_error, Layout};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, Index, IndexMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{CoreError, CoreResult};
use crate::memory::alloc;
use crate::sync::refcount;

/// Header stored immediately before element 0.
#[repr(C)]
struct Header {
    refcount: AtomicU32,
    size: u32,
}

const HEADER_SIZE: usize = mem::size_of::<Header>();

/// A copy-on-write sequence of `T`.
///
/// One pointer wide. Cloning is an atomic increment, so handles can be
/// captured by commands and sent to the render thread while the main thread
/// keeps working on its own copy.
///
/// # Example
///
/// ```rust
/// use hearth_core::CowData;
///
/// let mut a: CowData<u32> = CowData::from_slice(&[1, 2, 3, 4]).unwrap();
/// let b = a.clone();            // shares the block
/// a.set(0, 9);                  // forks: `b` is untouched
/// assert_eq!(a.as_slice(), &[9, 2, 3, 4]);
/// assert_eq!(b.as_slice(), &[1, 2, 3, 4]);
/// ```
pub struct CowData<T> {
    /// Points at element 0 of a live block, or `None` when empty.
    ptr: Option<NonNull<T>>,
    _marker: PhantomData<T>,
}

// SAFETY: a block is only mutated by its sole owner and the refcount is
// atomic, the same contract as `Arc<[T]>`.
unsafe impl<T: Send + Sync> Send for CowData<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for CowData<T> {}

impl<T> CowData<T> {
    /// Creates an empty container. Does not allocate.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ptr: None,
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.header().map_or(0, |h| h.size as usize)
    }

    /// Returns true if there are no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// Number of handles sharing this block, or 0 when empty.
    #[inline]
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.header()
            .map_or(0, |h| h.refcount.load(Ordering::Acquire))
    }

    /// Returns true if another handle shares this block.
    #[inline]
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.refcount() > 1
    }

    /// Returns true if both handles point at the same block (or are both
    /// empty).
    #[inline]
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Read-only view of the elements.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match self.ptr {
            // SAFETY: a live block holds `size` initialized elements and no
            // one mutates it while more than one handle exists.
            Some(data) => unsafe { std::slice::from_raw_parts(data.as_ptr(), self.len()) },
            None => &[],
        }
    }

    /// Iterates over the elements.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Element at `index`, or `None` if out of range.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Index of the first element equal to `value` at or after `from`.
    #[must_use]
    pub fn find(&self, value: &T, from: usize) -> Option<usize>
    where
        T: PartialEq,
    {
        self.as_slice()
            .get(from..)?
            .iter()
            .position(|item| item == value)
            .map(|offset| from + offset)
    }

    /// Drops this handle's reference. The container becomes empty.
    pub fn clear(&mut self) {
        self.release();
    }

    /// Makes this handle share `other`'s block.
    ///
    /// Assigning from a handle on the same block is a no-op. If `other` is
    /// losing a race against its final drop, this handle ends up empty.
    pub fn assign(&mut self, other: &Self) {
        if Self::ptr_eq(self, other) {
            return;
        }
        let shared = other.share();
        self.release();
        self.ptr = shared;
    }

    /// Takes a new reference on this handle's block, if it is still live.
    fn share(&self) -> Option<NonNull<T>> {
        let data = self.ptr?;
        // SAFETY: `data` points at a live block; the header precedes it.
        let header = unsafe { &*Self::header_ptr(data) };
        if refcount::conditional_increment(&header.refcount) == 0 {
            None
        } else {
            Some(data)
        }
    }

    /// Drops this handle's reference, destroying the block if it was the last.
    fn release(&mut self) {
        let Some(data) = self.ptr.take() else {
            return;
        };
        // SAFETY: `data` points at a live block we held a reference to.
        let header = unsafe { &*Self::header_ptr(data) };
        if refcount::decrement(&header.refcount) == 0 {
            let len = header.size as usize;
            // SAFETY: we were the last owner; the block holds `len` elements.
            unsafe { Self::destroy_block(data, len) };
        }
    }

    fn header(&self) -> Option<&Header> {
        // SAFETY: a live block's header is initialized and outlives `self`.
        self.ptr.map(|data| unsafe { &*Self::header_ptr(data) })
    }

    /// Byte offset from the block start to element 0.
    const fn data_offset() -> usize {
        if mem::align_of::<T>() > HEADER_SIZE {
            mem::align_of::<T>()
        } else {
            HEADER_SIZE
        }
    }

    const fn block_align() -> usize {
        if mem::align_of::<T>() > mem::align_of::<Header>() {
            mem::align_of::<T>()
        } else {
            mem::align_of::<Header>()
        }
    }

    /// Payload bytes reserved for `len` elements: the next power of two of
    /// the element bytes, `None` on overflow.
    fn payload_bytes(len: usize) -> Option<usize> {
        let bytes = len.checked_mul(mem::size_of::<T>())?;
        if bytes == 0 {
            Some(0)
        } else {
            bytes.checked_next_power_of_two()
        }
    }

    /// Layout of a block holding `len` elements, `None` on overflow.
    fn layout_for(len: usize) -> Option<Layout> {
        let size = Self::data_offset().checked_add(Self::payload_bytes(len)?)?;
        Layout::from_size_align(size, Self::block_align()).ok()
    }

    /// Layout of a block that already exists. Its size was validated when it
    /// was allocated.
    fn live_layout(len: usize) -> Layout {
        match Self::layout_for(len) {
            Some(layout) => layout,
            None => unreachable!("live block of {len} elements has no valid layout"),
        }
    }

    fn header_ptr(data: NonNull<T>) -> *mut Header {
        // SAFETY: the header sits in the same allocation, right before data.
        unsafe { data.as_ptr().cast::<u8>().sub(HEADER_SIZE).cast::<Header>() }
    }

    fn block_base(data: NonNull<T>) -> NonNull<u8> {
        // SAFETY: element 0 sits `data_offset` bytes into the allocation.
        unsafe { NonNull::new_unchecked(data.as_ptr().cast::<u8>().sub(Self::data_offset())) }
    }

    fn data_from_base(base: NonNull<u8>) -> NonNull<T> {
        // SAFETY: the allocation is at least `data_offset` bytes long.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(Self::data_offset()).cast::<T>()) }
    }

    fn set_size(data: NonNull<T>, len: usize) {
        debug_assert!(u32::try_from(len).is_ok());
        // SAFETY: only called by the sole owner of a live block.
        unsafe { (*Self::header_ptr(data)).size = len as u32 };
    }

    /// Allocates a block sized for `len` elements with refcount 1 and size 0.
    fn allocate_block(len: usize) -> CoreResult<NonNull<T>> {
        let layout = Self::layout_for(len).ok_or(CoreError::OutOfMemory { requested: len })?;
        let base = alloc::allocate(layout).ok_or(CoreError::OutOfMemory { requested: len })?;
        let data = Self::data_from_base(base);
        // SAFETY: the header slot is inside the fresh allocation and aligned.
        unsafe {
            ptr::write(
                Self::header_ptr(data),
                Header {
                    refcount: AtomicU32::new(1),
                    size: 0,
                },
            );
        }
        Ok(data)
    }

    /// Runs destructors and frees a block.
    ///
    /// # Safety
    ///
    /// The caller must be the block's last owner and `len` its element count.
    unsafe fn destroy_block(data: NonNull<T>, len: usize) {
        if mem::needs_drop::<T>() {
            // SAFETY: the first `len` elements are initialized.
            unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data.as_ptr(), len)) };
        }
        // SAFETY: the block was allocated with this layout.
        unsafe { alloc::deallocate(Self::block_base(data), Self::live_layout(len)) };
    }

    /// Resizes the unique (or absent) block so it can hold `new_len`
    /// elements, without constructing any. On failure nothing changes.
    ///
    /// The caller must write elements and update the size before anything
    /// can observe the block.
    fn reshape_block(&mut self, new_len: usize) -> CoreResult<NonNull<T>> {
        let Some(data) = self.ptr else {
            let data = Self::allocate_block(new_len)?;
            self.ptr = Some(data);
            return Ok(data);
        };
        debug_assert_eq!(self.refcount(), 1);

        let old_layout = Self::live_layout(self.len());
        let new_layout =
            Self::layout_for(new_len).ok_or(CoreError::OutOfMemory { requested: new_len })?;
        if old_layout.size() == new_layout.size() {
            return Ok(data);
        }

        // SAFETY: the block came from the facade with `old_layout`, and
        // `new_layout` passed `Layout` validation with the same alignment.
        let base = unsafe {
            alloc::reallocate(Self::block_base(data), old_layout, new_layout.size())
        }
        .ok_or(CoreError::OutOfMemory { requested: new_len })?;

        let data = Self::data_from_base(base);
        self.ptr = Some(data);
        Ok(data)
    }

    /// Shrinks a unique block after its size was lowered from `old_len` to
    /// `new_len` and the trimmed elements were dropped. A zero `new_len`
    /// frees the block.
    fn shrink_block(&mut self, old_len: usize, new_len: usize) {
        let Some(data) = self.ptr else {
            return;
        };
        let old_layout = Self::live_layout(old_len);
        if new_len == 0 {
            self.ptr = None;
            // SAFETY: sole owner; no elements remain constructed.
            unsafe { alloc::deallocate(Self::block_base(data), old_layout) };
            return;
        }

        let new_layout = Self::live_layout(new_len);
        if old_layout.size() == new_layout.size() {
            return;
        }
        // SAFETY: allocated with `old_layout`; `new_layout` is valid and
        // shares its alignment.
        match unsafe { alloc::reallocate(Self::block_base(data), old_layout, new_layout.size()) } {
            Some(base) => self.ptr = Some(Self::data_from_base(base)),
            None => handle_alloc_error(new_layout),
        }
    }
}

impl<T> CowData<T> {
    /// Builds a container that takes ownership of `items`.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidParameter`] if the length does not fit the size
    /// header, [`CoreError::OutOfMemory`] if the block cannot be allocated.
    pub fn try_from_vec(items: Vec<T>) -> CoreResult<Self> {
        if items.is_empty() {
            return Ok(Self::new());
        }
        check_len("try_from_vec", items.len())?;

        let mut builder = BlockBuilder::new(items.len())?;
        for item in items {
            builder.push(item);
        }
        Ok(Self {
            ptr: Some(builder.finish()),
            _marker: PhantomData,
        })
    }

    /// Raw bytes of a plain-old-data payload, e.g. for a GPU upload.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8]
    where
        T: bytemuck::Pod,
    {
        bytemuck::cast_slice(self.as_slice())
    }
}

impl<T: Clone> CowData<T> {
    /// Builds a container holding clones of `items`.
    ///
    /// # Errors
    ///
    /// Same as [`CowData::try_from_vec`].
    pub fn from_slice(items: &[T]) -> CoreResult<Self> {
        if items.is_empty() {
            return Ok(Self::new());
        }
        check_len("from_slice", items.len())?;

        let mut builder = BlockBuilder::new(items.len())?;
        for item in items {
            builder.push(item.clone());
        }
        Ok(Self {
            ptr: Some(builder.finish()),
            _marker: PhantomData,
        })
    }

    /// Forks the block if it is shared, so this handle owns it exclusively.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfMemory`] if the copy cannot be allocated. The handle
    /// still shares the original block in that case.
    pub fn try_make_unique(&mut self) -> CoreResult<()> {
        if self.refcount() <= 1 {
            return Ok(());
        }

        let mut builder = BlockBuilder::new(self.len())?;
        for item in self.as_slice() {
            builder.push(item.clone());
        }
        let fresh = builder.finish();

        self.release();
        self.ptr = Some(fresh);
        Ok(())
    }

    /// Fork for the infallible accessors. Allocation failure is fatal here,
    /// as it is for `Vec`.
    fn make_unique(&mut self) {
        if let Err(err) = self.try_make_unique() {
            tracing::warn!("copy-on-write fork failed: {err}");
            handle_alloc_error(Self::live_layout(self.len()));
        }
    }

    /// Writable view of the elements. Forks first if the block is shared.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.make_unique();
        match self.ptr {
            // SAFETY: the block is now exclusively ours and holds `len`
            // initialized elements.
            Some(data) => unsafe { std::slice::from_raw_parts_mut(data.as_ptr(), self.len()) },
            None => &mut [],
        }
    }

    /// Mutable element access. Forks first if the block is shared.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        let len = self.len();
        assert!(
            index < len,
            "index {index} out of range for CowData of length {len}"
        );
        &mut self.as_mut_slice()[index]
    }

    /// Overwrites the element at `index`. Forks first if the block is shared.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, value: T) {
        *self.get_mut(index) = value;
    }

    /// Grows (default-constructing the tail) or shrinks (dropping the tail)
    /// to exactly `new_len` elements. Resizing to zero releases the block.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidParameter`] if `new_len` does not fit the `u32`
    /// size header, [`CoreError::OutOfMemory`] if the block cannot be
    /// allocated or its size overflows. On error the contents are unchanged.
    pub fn resize(&mut self, new_len: usize) -> CoreResult<()>
    where
        T: Default,
    {
        check_len("resize", new_len)?;
        let old_len = self.len();
        if new_len == old_len {
            return Ok(());
        }
        if new_len == 0 {
            self.release();
            return Ok(());
        }
        if Self::layout_for(new_len).is_none() {
            return Err(CoreError::OutOfMemory { requested: new_len });
        }

        self.try_make_unique()?;

        if new_len > old_len {
            // Construct the tail up front so a failure leaves nothing behind.
            let mut tail = Vec::new();
            tail.try_reserve_exact(new_len - old_len)
                .map_err(|_| CoreError::OutOfMemory { requested: new_len })?;
            tail.extend((old_len..new_len).map(|_| T::default()));

            let data = self.reshape_block(new_len)?;
            // SAFETY: the block has room for `new_len` elements, slots
            // `old_len..new_len` are uninitialized, and `tail` holds exactly
            // that many values whose ownership moves into the block.
            unsafe {
                ptr::copy_nonoverlapping(tail.as_ptr(), data.as_ptr().add(old_len), tail.len());
                tail.set_len(0);
            }
            Self::set_size(data, new_len);
        } else {
            self.truncate(new_len);
        }
        Ok(())
    }

    /// Drops every element from `new_len` onwards and shrinks the block.
    /// Does nothing if `new_len >= len()`; truncating to zero releases the
    /// block. Forks first if the block is shared.
    pub fn truncate(&mut self, new_len: usize) {
        let old_len = self.len();
        if new_len >= old_len {
            return;
        }
        if new_len == 0 {
            self.release();
            return;
        }

        self.make_unique();
        let Some(data) = self.ptr else {
            unreachable!("truncating a non-empty container without a block");
        };
        // Move the trimmed elements out before touching the allocation so a
        // panicking destructor cannot leave the header inconsistent.
        let trimmed: Vec<T> = if mem::needs_drop::<T>() {
            // SAFETY: slots `new_len..old_len` are initialized; the size is
            // lowered right after, so each is read exactly once.
            (new_len..old_len)
                .map(|i| unsafe { ptr::read(data.as_ptr().add(i)) })
                .collect()
        } else {
            Vec::new()
        };
        Self::set_size(data, new_len);
        self.shrink_block(old_len, new_len);
        drop(trimmed);
    }

    /// Inserts `value` at `pos`, shifting later elements up.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidParameter`] if `pos > len()`,
    /// [`CoreError::OutOfMemory`] if the block cannot grow. On error the
    /// contents are unchanged and `value` is dropped.
    pub fn insert(&mut self, pos: usize, value: T) -> CoreResult<()> {
        let len = self.len();
        if pos > len {
            return Err(CoreError::InvalidParameter {
                operation: "insert",
                reason: format!("position {pos} is past the end (length {len})"),
            });
        }
        check_len("insert", len + 1)?;

        self.try_make_unique()?;
        let data = self.reshape_block(len + 1)?;
        // SAFETY: the block has room for `len + 1` elements; the shifted
        // range stays inside it and slot `pos` is written exactly once.
        unsafe {
            let at = data.as_ptr().add(pos);
            ptr::copy(at, at.add(1), len - pos);
            ptr::write(at, value);
        }
        Self::set_size(data, len + 1);
        Ok(())
    }

    /// Appends `value` at the end.
    ///
    /// # Errors
    ///
    /// Same as [`CowData::insert`].
    pub fn push(&mut self, value: T) -> CoreResult<()> {
        self.insert(self.len(), value)
    }

    /// Removes and returns the element at `pos`, shifting later elements
    /// down. Removing the last element releases the block.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is out of range.
    pub fn remove(&mut self, pos: usize) -> T {
        let len = self.len();
        assert!(
            pos < len,
            "remove index {pos} out of range for CowData of length {len}"
        );
        self.make_unique();
        let Some(data) = self.ptr else {
            unreachable!("removing from a non-empty container without a block");
        };

        // SAFETY: `pos < len`, the block is exclusively ours, and the element
        // read out is overwritten by the shift before the size drops.
        let value = unsafe {
            let at = data.as_ptr().add(pos);
            let value = ptr::read(at);
            ptr::copy(at.add(1), at, len - pos - 1);
            value
        };
        Self::set_size(data, len - 1);
        self.shrink_block(len, len - 1);
        value
    }
}

fn check_len(operation: &'static str, len: usize) -> CoreResult<()> {
    if u32::try_from(len).is_err() {
        return Err(CoreError::InvalidParameter {
            operation,
            reason: format!("length {len} does not fit the u32 size header"),
        });
    }
    Ok(())
}

/// A block under construction. Dropping it before [`finish`](Self::finish)
/// drops whatever was written and frees the block.
struct BlockBuilder<T> {
    data: NonNull<T>,
    len: usize,
    written: usize,
}

impl<T> BlockBuilder<T> {
    fn new(len: usize) -> CoreResult<Self> {
        Ok(Self {
            data: CowData::<T>::allocate_block(len)?,
            len,
            written: 0,
        })
    }

    fn push(&mut self, value: T) {
        assert!(self.written < self.len, "block builder overrun");
        // SAFETY: slot `written` is inside the block and uninitialized.
        unsafe { ptr::write(self.data.as_ptr().add(self.written), value) };
        self.written += 1;
    }

    fn finish(self) -> NonNull<T> {
        assert_eq!(self.written, self.len, "block builder finished early");
        let data = self.data;
        CowData::<T>::set_size(data, self.len);
        mem::forget(self);
        data
    }
}

impl<T> Drop for BlockBuilder<T> {
    fn drop(&mut self) {
        // SAFETY: the first `written` slots are initialized, and the block
        // was allocated for `len` elements and never shared.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.data.as_ptr(),
                self.written,
            ));
            alloc::deallocate(
                CowData::<T>::block_base(self.data),
                CowData::<T>::live_layout(self.len),
            );
        }
    }
}

impl<T> Default for CowData<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CowData<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.share(),
            _marker: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.assign(source);
    }
}

impl<T> Drop for CowData<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> Deref for CowData<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> Index<usize> for CowData<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Clone> IndexMut<usize> for CowData<T> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.get_mut(index)
    }
}

impl<'a, T> IntoIterator for &'a CowData<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> FromIterator<T> for CowData<T> {
    /// # Panics
    ///
    /// Panics if the elements cannot be stored, as `Vec` does on capacity
    /// overflow.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let items: Vec<T> = iter.into_iter().collect();
        match Self::try_from_vec(items) {
            Ok(data) => data,
            Err(err) => panic!("cannot collect into CowData: {err}"),
        }
    }
}

impl<T: PartialEq> PartialEq for CowData<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other) || self.as_slice() == other.as_slice()
    }
}

impl<T: Eq> Eq for CowData<T> {}

impl<T: PartialEq> PartialEq<[T]> for CowData<T> {
    fn eq(&self, other: &[T]) -> bool {
        self.as_slice() == other
    }
}

impl<T: PartialEq, const N: usize> PartialEq<[T; N]> for CowData<T> {
    fn eq(&self, other: &[T; N]) -> bool {
        self.as_slice() == other
    }
}

impl<T: Hash> Hash for CowData<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for CowData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
