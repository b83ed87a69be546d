//! # HEARTH Server Wrapper
//!
//! Puts a server object on its own thread and lets any other thread drive
//! it through a [`hearth_core::CommandQueue`]:
//! - Fire-and-forget calls never wait for the server
//! - Synchronous calls block on a per-call sync slot
//! - Queued-up frame requests collapse into one draw
//!
//! ## Example
//!
//! ```rust
//! use hearth_server::{IdPool, Server, ServerConfig, ServerWrap};
//!
//! #[derive(Default)]
//! struct Meshes {
//!     next_id: u64,
//!     live: Vec<u64>,
//!     freed: Vec<u64>,
//! }
//!
//! impl Server for Meshes {
//!     fn draw(&mut self, _swap_buffers: bool, _frame_step: f64) {}
//! }
//!
//! let config = ServerConfig::default();
//! let pool = IdPool::from_config(&config);
//! let wrap = ServerWrap::start(Meshes::default(), config).unwrap();
//!
//! let id = pool.acquire(&wrap, |server| {
//!     server.next_id += 1;
//!     server.next_id
//! });
//! wrap.call(move |server| server.live.push(id));
//! wrap.draw(true, 1.0 / 60.0);
//! wrap.sync();
//!
//! // One refill created a whole batch; hand back the ids never used.
//! pool.free_cached(&wrap, |server, unused| server.freed.push(unused));
//! let meshes = wrap.finish();
//! assert_eq!(meshes.live, vec![1]);
//! assert_eq!(meshes.freed.len(), 59);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
mod id_pool;
mod server;
mod wrap;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use id_pool::IdPool;
pub use server::Server;
pub use wrap::{ServerWrap, SERVER_THREAD_NAME};
