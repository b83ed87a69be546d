//! # HEARTH Core Runtime
//!
//! Cross-thread plumbing for an engine split between a main thread and a
//! render thread:
//! - A multi-producer, single-consumer command queue over a fixed ring arena
//! - Copy-on-write shared arrays for handing bulk data across threads
//! - Zero allocations on the push path once the arena exists
//!
//! ## Architecture Rules
//!
//! 1. **Producers never run server code** - they record closures
//! 2. **One consumer** - commands execute in push order on one thread
//! 3. **Share, don't copy** - large payloads travel as [`CowData`] handles
//!
//! ## Example
//!
//! ```rust
//! use hearth_core::{CommandQueue, CowData, QueueConfig};
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! let queue = CommandQueue::new(QueueConfig::default()).unwrap();
//! let vertices = CowData::from_slice(&[1.0_f32, 2.0, 3.0]).unwrap();
//! let uploaded = Arc::new(Mutex::new(CowData::new()));
//!
//! let shared = vertices.clone();
//! let sink = Arc::clone(&uploaded);
//! queue.push(move || *sink.lock() = shared);
//!
//! queue.flush_all();
//! assert!(CowData::ptr_eq(&uploaded.lock(), &vertices));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::QueueConfig;
pub use error::{CoreError, CoreResult};
pub use memory::{AllocStats, CowData};
pub use sync::{CommandQueue, QueueCursors, QueueStats, Semaphore};
