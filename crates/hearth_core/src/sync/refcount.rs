//! # Atomic Reference Count Operations
//!
//! The counter protocol shared by every COW storage block.
//!
//! ```text
//! conditional_increment CAS loop, only if > 0     handle copy that may race a drop
//! decrement             fetch_sub(1, Release)      handle drop
//!                       + Acquire fence at zero    before the last owner destroys
//! ```

use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Increments only if the count is strictly positive. Returns the new count,
/// or `0` if the count was already zero and nothing changed.
///
/// A copier that loses the race against the final drop observes zero here and
/// must treat the source as empty.
#[inline]
pub fn conditional_increment(count: &AtomicU32) -> u32 {
    let mut current = count.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return 0;
        }
        assert!(current < u32::MAX, "reference count overflow");
        match count.compare_exchange_weak(
            current,
            current + 1,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => return current + 1,
            Err(observed) => current = observed,
        }
    }
}

/// Decrements and returns the new count. When it returns `0` the caller was
/// the last owner and every write made through other handles is visible.
#[inline]
pub fn decrement(count: &AtomicU32) -> u32 {
    let previous = count.fetch_sub(1, Ordering::Release);
    debug_assert!(previous > 0, "reference count underflow");
    if previous == 1 {
        fence(Ordering::Acquire);
    }
    previous - 1
}
