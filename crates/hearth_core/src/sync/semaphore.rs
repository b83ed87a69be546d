//! # Counting Semaphore
//!
//! `parking_lot` mutex + condvar pair. Used for the queue's signalling
//! semaphore (one permit per unconsumed command) and for each sync slot
//! (binary use: one post per synchronous command).

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    #[must_use]
    pub const fn new(permits: u32) -> Self {
        Self {
            permits: parking_lot::const_mutex(permits),
            available: Condvar::new(),
        }
    }

    /// Adds one permit and wakes one waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Current number of permits (diagnostics only, may be stale).
    #[must_use]
    pub fn permits(&self) -> u32 {
        *self.permits.lock()
    }
}
