//! # Cross-Thread Command Queue
//!
//! Many producers, one consumer. Producers push type-erased callables into a
//! fixed ring arena; the consumer thread drains them in FIFO order.
//!
//! ## Safety Note
//!
//! Records are written into raw arena memory and invoked through a small
//! function-pointer table. Every cursor and header access happens under the
//! queue mutex; callables run with the mutex released.

#![allow(unsafe_code)]
//!
//! ## Record Layout
//!
//! ```text
//! offset ─┐
//!         ▼
//!         ┌────────────┬──────────────────────────────────────────┐
//!         │ header u32 │ body: RecordMeta { invoke, discard, sync }│
//!         │ (pad to 8) │       + captured callable, rounded to 8   │
//!         └────────────┴──────────────────────────────────────────┘
//!
//! header = body_size << 1 | in_use      header == 0 → wrap to offset 0
//! ```
//!
//! ## Cursors
//!
//! ```text
//!   0                                                           N
//!   ├──── free ────┬── DESTRUCTED ──┬──── LIVE_UNREAD ────┬ free ┤
//!                  D                R                     W
//!
//! W  write:   producers allocate here
//! R  read:    consumer invokes here
//! D  dealloc: destructed records are reclaimed here, FIFO
//! ```
//!
//! One header's worth of bytes is always left free at the arena end so a
//! wrap sentinel can be written there.

use std::mem;
use std::ptr;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use super::sync_slot::SyncSlotPool;
use super::Semaphore;
use crate::config::{QueueConfig, RECORD_ALIGN};
use crate::error::CoreResult;
use crate::memory::arena::{
    body_size, live_header, CommandArena, IN_USE_BIT, RECORD_HEADER_SIZE, WRAP_SENTINEL,
};

/// Snapshot of the three ring cursors, in bytes from the arena start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCursors {
    /// Where the next record will be written.
    pub write: usize,
    /// Next record the consumer will invoke.
    pub read: usize,
    /// Oldest record not yet reclaimed.
    pub dealloc: usize,
}

/// Lifetime counters for one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Commands written to the ring.
    pub pushed: u64,
    /// Commands invoked by the consumer (panicking ones included).
    pub flushed: u64,
    /// Commands dropped unread by [`CommandQueue::discard_pending`].
    pub discarded: u64,
    /// Times the write cursor restarted at offset 0.
    pub wraps: u64,
    /// Times a producer blocked because the ring was full.
    pub backpressure_waits: u64,
    /// Times a synchronous producer blocked because every sync slot was taken.
    pub sync_waits: u64,
}

/// Type-erased record prefix. Always the first field of a [`Record`].
#[repr(C)]
struct RecordMeta {
    invoke: unsafe fn(*mut RecordMeta),
    discard: unsafe fn(*mut RecordMeta),
    sync_slot: Option<u32>,
}

#[repr(C)]
struct Record<F> {
    meta: RecordMeta,
    func: F,
}

/// Moves the callable out of its record and calls it.
///
/// # Safety
///
/// `meta` must point at a live `Record<F>` that has not been invoked or
/// discarded yet.
unsafe fn invoke_record<F: FnOnce()>(meta: *mut RecordMeta) {
    // SAFETY: `meta` is the first field of a repr(C) Record<F>.
    let func = unsafe { ptr::read(ptr::addr_of!((*meta.cast::<Record<F>>()).func)) };
    func();
}

/// Drops the callable in place without calling it.
///
/// # Safety
///
/// Same contract as [`invoke_record`].
unsafe fn discard_record<F>(meta: *mut RecordMeta) {
    // SAFETY: `meta` is the first field of a repr(C) Record<F>.
    unsafe { ptr::drop_in_place(ptr::addr_of_mut!((*meta.cast::<Record<F>>()).func)) };
}

#[derive(Debug, Default)]
struct QueueState {
    write: usize,
    read: usize,
    dealloc: usize,
    stats: QueueStats,
}

/// Multi-producer, single-consumer queue of deferred calls.
///
/// The owner of the consumer role calls [`flush_one`](Self::flush_one),
/// [`flush_all`](Self::flush_all) or
/// [`wait_and_flush_one`](Self::wait_and_flush_one) from exactly one thread.
/// Any thread may push.
///
/// # Example
///
/// ```rust
/// use hearth_core::{CommandQueue, QueueConfig};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
///
/// let queue = CommandQueue::new(QueueConfig::default()).unwrap();
/// let hits = Arc::new(AtomicU32::new(0));
///
/// let counter = Arc::clone(&hits);
/// queue.push(move || {
///     counter.fetch_add(1, Ordering::Relaxed);
/// });
///
/// assert_eq!(queue.flush_all(), 1);
/// assert_eq!(hits.load(Ordering::Relaxed), 1);
/// ```
pub struct CommandQueue {
    arena: CommandArena,
    state: Mutex<QueueState>,
    /// Notified by every consumer epilogue and every sync slot release.
    progress: Condvar,
    sync_slots: SyncSlotPool,
    signal: Option<Semaphore>,
    config: QueueConfig,
}

// SAFETY: every callable stored in the arena is `Send`, and all shared state
// is guarded by `state` or is itself thread safe.
unsafe impl Send for CommandQueue {}
// SAFETY: see above; `&CommandQueue` only exposes lock-protected operations.
unsafe impl Sync for CommandQueue {}

impl CommandQueue {
    /// Builds a queue with a freshly allocated arena.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`](crate::CoreError::InvalidConfig)
    /// if `config` fails validation and
    /// [`CoreError::OutOfMemory`](crate::CoreError::OutOfMemory) if the arena
    /// cannot be allocated.
    pub fn new(config: QueueConfig) -> CoreResult<Self> {
        config.validate()?;
        let arena = CommandArena::new(config.arena_size)?;
        info!(
            arena_size = config.arena_size,
            sync_slots = config.sync_slots,
            signalled = config.use_signal_semaphore,
            "command queue created"
        );
        Ok(Self {
            arena,
            state: Mutex::new(QueueState::default()),
            progress: Condvar::new(),
            sync_slots: SyncSlotPool::new(config.sync_slots),
            signal: config.use_signal_semaphore.then(|| Semaphore::new(0)),
            config,
        })
    }

    /// Configuration this queue was built with.
    #[must_use]
    #[inline]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current cursor positions.
    #[must_use]
    pub fn cursors(&self) -> QueueCursors {
        let state = self.state.lock();
        QueueCursors {
            write: state.write,
            read: state.read,
            dealloc: state.dealloc,
        }
    }

    /// Counters accumulated since construction.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    /// True when no pushed command is waiting to be invoked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.read == state.write
    }

    /// Enqueues `func` and returns without waiting for it to run.
    ///
    /// Blocks only while the ring is full.
    ///
    /// # Panics
    ///
    /// Panics if the command could never fit in the arena.
    pub fn push<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(func, None);
        self.signal_command();
    }

    /// Enqueues `func` and blocks until the consumer has run it.
    ///
    /// `func` may borrow from the caller's stack: the call does not return
    /// until the callable has been invoked and dropped.
    ///
    /// Must not be called from the consumer thread.
    ///
    /// # Panics
    ///
    /// Panics if the command could never fit in the arena.
    pub fn push_and_sync<F>(&self, func: F)
    where
        F: FnOnce() + Send,
    {
        let slot = self.acquire_sync_slot();
        self.enqueue(func, Some(slot));
        self.signal_command();
        self.sync_slots.wait(slot);
        self.release_sync_slot(slot);
    }

    /// Runs `func` on the consumer thread and returns its result.
    ///
    /// # Panics
    ///
    /// Panics if `func` panicked on the consumer thread or was discarded
    /// unrun, or if the command could never fit in the arena.
    pub fn push_and_ret<R, F>(&self, func: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        let mut result = None;
        let out = &mut result;
        self.push_and_sync(move || *out = Some(func()));
        match result {
            Some(value) => value,
            None => panic!("command did not complete on the consumer thread"),
        }
    }

    /// Invokes the oldest pending command, if any. Returns whether one ran.
    ///
    /// A panic inside the command propagates after its record has been
    /// released and any synchronous caller woken.
    pub fn flush_one(&self) -> bool {
        let Some((offset, meta)) = self.claim_next() else {
            return false;
        };
        // SAFETY: the record is claimed and still marked in use, so only
        // this thread touches it until the epilogue clears the bit.
        let (invoke, sync_slot) = unsafe { ((*meta).invoke, (*meta).sync_slot) };
        let _epilogue = Epilogue {
            queue: self,
            offset,
            sync_slot,
            invoked: true,
        };
        // SAFETY: claimed records are invoked or discarded exactly once.
        unsafe { invoke(meta) };
        true
    }

    /// Drops every pending command without invoking it and returns how many
    /// were dropped.
    ///
    /// Synchronous callers of discarded commands are woken as if the command
    /// had run; [`push_and_ret`](Self::push_and_ret) callers panic. Consumer
    /// side: meant for a consumer that can no longer run commands.
    pub fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        while let Some((offset, meta)) = self.claim_next() {
            // SAFETY: as in `flush_one`.
            let (discard, sync_slot) = unsafe { ((*meta).discard, (*meta).sync_slot) };
            let _epilogue = Epilogue {
                queue: self,
                offset,
                sync_slot,
                invoked: false,
            };
            // SAFETY: as in `flush_one`.
            unsafe { discard(meta) };
            discarded += 1;
        }
        let mut state = self.state.lock();
        while self.dealloc_one(&mut state) {}
        drop(state);
        if discarded > 0 {
            warn!(discarded, "pending commands discarded unrun");
        }
        discarded
    }

    /// Waits for the signalling semaphore, then flushes one command.
    ///
    /// # Panics
    ///
    /// Panics if the queue was built without `use_signal_semaphore`.
    pub fn wait_and_flush_one(&self) -> bool {
        let Some(signal) = &self.signal else {
            panic!("wait_and_flush_one requires a queue built with use_signal_semaphore");
        };
        signal.wait();
        self.flush_one()
    }

    /// Invokes every pending command, then reclaims everything releasable.
    /// Returns the number of commands invoked.
    pub fn flush_all(&self) -> usize {
        let mut flushed = 0;
        while self.flush_one() {
            flushed += 1;
        }
        let mut state = self.state.lock();
        while self.dealloc_one(&mut state) {}
        flushed
    }

    /// Advances `read` past the oldest unread record and returns it. The
    /// record keeps its in-use bit until its epilogue runs.
    fn claim_next(&self) -> Option<(usize, *mut RecordMeta)> {
        let mut state = self.state.lock();
        loop {
            if state.read == state.write {
                return None;
            }
            // SAFETY: `read != write`, so a header was written at `read`.
            let header = unsafe { self.arena.read_header(state.read) };
            if header == WRAP_SENTINEL {
                state.read = 0;
                continue;
            }
            let offset = state.read;
            state.read += RECORD_HEADER_SIZE + body_size(header);
            return Some((offset, self.arena.body_ptr(offset).cast::<RecordMeta>()));
        }
    }

    fn signal_command(&self) {
        if let Some(signal) = &self.signal {
            signal.post();
        }
    }

    fn enqueue<F>(&self, func: F, sync_slot: Option<u32>)
    where
        F: FnOnce() + Send,
    {
        if mem::align_of::<F>() > RECORD_ALIGN {
            let boxed = Box::new(func);
            self.write_record(
                move || {
                    let func = *boxed;
                    func();
                },
                sync_slot,
            );
        } else {
            self.write_record(func, sync_slot);
        }
    }

    fn write_record<F: FnOnce()>(&self, func: F, sync_slot: Option<u32>) {
        assert!(mem::align_of::<Record<F>>() <= RECORD_ALIGN);
        let body = mem::size_of::<Record<F>>().next_multiple_of(RECORD_ALIGN);
        let record_size = RECORD_HEADER_SIZE + body;
        assert!(
            record_size + RECORD_HEADER_SIZE <= self.arena.capacity(),
            "command of {record_size} bytes can never fit in a {} byte arena",
            self.arena.capacity()
        );

        let mut state = self.state.lock();
        let offset = loop {
            if let Some(offset) = self.allocate(&mut state, record_size) {
                break offset;
            }
            state.stats.backpressure_waits += 1;
            debug!(record_size, "command queue full, waiting for the consumer");
            self.progress.wait(&mut state);
        };

        // SAFETY: `allocate` reserved `record_size` bytes at `offset`; the
        // body pointer is 8-aligned and `Record<F>` needs no more.
        unsafe {
            ptr::write(
                self.arena.body_ptr(offset).cast::<Record<F>>(),
                Record {
                    meta: RecordMeta {
                        invoke: invoke_record::<F>,
                        discard: discard_record::<F>,
                        sync_slot,
                    },
                    func,
                },
            );
            self.arena.write_header(offset, live_header(body));
        }
        state.stats.pushed += 1;
    }

    /// Reserves `record_size` bytes and returns their offset, or `None` when
    /// the consumer has to make progress first.
    fn allocate(&self, state: &mut QueueState, record_size: usize) -> Option<usize> {
        let capacity = self.arena.capacity();
        loop {
            if state.write < state.dealloc {
                if state.dealloc - state.write > record_size {
                    break;
                }
                if !self.dealloc_one(state) {
                    return None;
                }
            } else {
                if capacity - state.write >= record_size + RECORD_HEADER_SIZE {
                    break;
                }
                if state.read == state.write && state.dealloc == state.write {
                    // Fully drained: restart at the front without a sentinel.
                    state.write = 0;
                    state.read = 0;
                    state.dealloc = 0;
                    state.stats.wraps += 1;
                    trace!("command queue drained, rewinding to the arena start");
                    continue;
                }
                if state.dealloc == 0 {
                    // Wrapping now would make write == dealloc.
                    if !self.dealloc_one(state) {
                        return None;
                    }
                    continue;
                }
                // SAFETY: the end guard always leaves room for one header.
                unsafe { self.arena.write_header(state.write, WRAP_SENTINEL) };
                trace!(at = state.write, "command queue wrapped");
                state.write = 0;
                state.stats.wraps += 1;
            }
        }
        let offset = state.write;
        state.write += record_size;
        Some(offset)
    }

    /// Reclaims the oldest destructed record. Returns whether the dealloc
    /// cursor moved.
    fn dealloc_one(&self, state: &mut QueueState) -> bool {
        if state.dealloc == state.read {
            // A sentinel the consumer has not stepped over yet carries no
            // command, so both cursors may skip it.
            if state.read != state.write
                // SAFETY: `read != write`, so a header was written at `read`.
                && unsafe { self.arena.read_header(state.read) } == WRAP_SENTINEL
            {
                state.read = 0;
                state.dealloc = 0;
                return true;
            }
            return false;
        }
        // SAFETY: `dealloc != read`, so `dealloc` sits on a written header.
        let header = unsafe { self.arena.read_header(state.dealloc) };
        if header == WRAP_SENTINEL {
            state.dealloc = 0;
            return true;
        }
        if header & IN_USE_BIT != 0 {
            return false;
        }
        state.dealloc += RECORD_HEADER_SIZE + body_size(header);
        true
    }

    fn acquire_sync_slot(&self) -> u32 {
        let mut state = self.state.lock();
        loop {
            if let Some(slot) = self.sync_slots.try_acquire() {
                return slot;
            }
            state.stats.sync_waits += 1;
            debug!(
                slots = self.sync_slots.len(),
                "all sync slots taken, waiting for one to free up"
            );
            self.progress.wait(&mut state);
        }
    }

    fn release_sync_slot(&self, slot: u32) {
        let state = self.state.lock();
        self.sync_slots.release(slot);
        drop(state);
        self.progress.notify_all();
    }

    /// Consumer epilogue: wake the synchronous caller, mark the record
    /// destructed and wake blocked producers.
    fn complete_record(&self, offset: usize, sync_slot: Option<u32>, invoked: bool) {
        let mut state = self.state.lock();
        if let Some(slot) = sync_slot {
            self.sync_slots.post(slot);
        }
        // SAFETY: `offset` holds the header of the record just invoked; it
        // cannot be reclaimed while its in-use bit is set.
        unsafe {
            let header = self.arena.read_header(offset);
            self.arena.write_header(offset, header & !IN_USE_BIT);
        }
        if invoked {
            state.stats.flushed += 1;
        } else {
            state.stats.discarded += 1;
        }
        drop(state);
        self.progress.notify_all();
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("config", &self.config)
            .field("cursors", &self.cursors())
            .field("sync_slots_in_use", &self.sync_slots.in_use_count())
            .field("signals_pending", &self.signal.as_ref().map(Semaphore::permits))
            .finish_non_exhaustive()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut cursor = state.read;
        let mut dropped = 0_usize;
        while cursor != state.write {
            // SAFETY: every offset between read and write holds a header.
            let header = unsafe { self.arena.read_header(cursor) };
            if header == WRAP_SENTINEL {
                cursor = 0;
                continue;
            }
            let meta = self.arena.body_ptr(cursor).cast::<RecordMeta>();
            // SAFETY: unread records have never been invoked.
            unsafe { ((*meta).discard)(meta) };
            cursor += RECORD_HEADER_SIZE + body_size(header);
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "command queue dropped with unconsumed commands");
        }
    }
}

/// Runs [`CommandQueue::complete_record`] even if the command panics.
struct Epilogue<'q> {
    queue: &'q CommandQueue,
    offset: usize,
    sync_slot: Option<u32>,
    invoked: bool,
}

impl Drop for Epilogue<'_> {
    fn drop(&mut self) {
        self.queue
            .complete_record(self.offset, self.sync_slot, self.invoked);
    }
}
