//! # Cross-Thread Synchronization
//!
//! The main thread records work; the render thread executes it.
//!
//! ## The Problem
//!
//! ```text
//! Main thread:    "draw this mesh with this material"
//! Render thread:  owns the GPU context, must be the one doing it
//!
//! Calling across directly:  DATA RACE on server state
//! One big mutex:            main thread stalls behind every frame
//! ```
//!
//! ## The Solution: A Command Ring
//!
//! ```text
//! Producers (any thread)         Consumer (render thread)
//!   push(cmd) ──► [ ring arena ] ──► flush_one / flush_all
//!   push_and_sync(cmd) ◄── sync slot semaphore posted after cmd runs
//! ```
//!
//! Pushing is a copy into pre-allocated memory. Only full rings and
//! synchronous calls ever block.

mod command_queue;
pub mod refcount;
mod semaphore;
mod sync_slot;

pub use command_queue::{CommandQueue, QueueCursors, QueueStats};
pub use semaphore::Semaphore;
