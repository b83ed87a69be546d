//! # Memory Management
//!
//! Raw storage for the cross-thread runtime.
//!
//! ## Design Philosophy
//!
//! - Large data is shared by reference count, never copied until written
//! - The command ring is allocated once and reused forever
//! - Every raw allocation goes through one facade so leaks are countable

pub mod alloc;
pub(crate) mod arena;
mod cow;

pub use alloc::AllocStats;
pub use cow::CowData;
