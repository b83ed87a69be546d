//! # Resource Id Pool
//!
//! Creating a resource id needs the server, which lives on another thread.
//! Doing one synchronous round trip per id stalls the main thread, so ids are
//! created in batches and handed out from a local cache.
//!
//! ```text
//! acquire() ── cache hit ─────────────────────────────► id
//!     │
//!     └─ cache empty ── call_ret(create × batch) ──► refill ──► id
//! ```

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::server::Server;
use crate::wrap::ServerWrap;

/// Cache of ids created ahead of time on the server.
#[derive(Debug)]
pub struct IdPool<Id> {
    /// Doubles as the allocation mutex: held across a refill round trip so
    /// concurrent callers wait for one batch instead of requesting several.
    cached: Mutex<Vec<Id>>,
    batch: usize,
}

impl<Id: Send> IdPool<Id> {
    /// Creates an empty pool that refills `batch` ids at a time.
    ///
    /// # Panics
    ///
    /// Panics if `batch` is zero.
    #[must_use]
    pub fn new(batch: usize) -> Self {
        assert!(batch > 0, "id pool batch size must be at least 1");
        Self {
            cached: Mutex::new(Vec::with_capacity(batch)),
            batch,
        }
    }

    /// Creates a pool sized by `config.id_pool_size`.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.id_pool_size)
    }

    /// Ids currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cached.lock().len()
    }

    /// Returns true if the next `acquire` will refill.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cached.lock().is_empty()
    }

    /// Returns an id, creating a fresh batch on the server if the cache is
    /// empty.
    ///
    /// In direct mode, or on the server thread, `create` runs once inline
    /// and the cache is left alone.
    pub fn acquire<S, F>(&self, wrap: &ServerWrap<S>, mut create: F) -> Id
    where
        S: Server,
        F: FnMut(&mut S) -> Id + Send,
    {
        if !wrap.is_threaded() || wrap.is_server_thread() {
            return wrap.call_ret(create);
        }

        let mut cached = self.cached.lock();
        if let Some(id) = cached.pop() {
            return id;
        }

        let batch = self.batch;
        let (first, mut rest) = wrap.call_ret(|server| {
            let first = create(server);
            let rest: Vec<Id> = (1..batch).map(|_| create(server)).collect();
            (first, rest)
        });
        // Popped from the back, so keep creation order front to back.
        rest.reverse();
        *cached = rest;
        first
    }

    /// Hands every cached id back to the server through `free`.
    pub fn free_cached<S, F>(&self, wrap: &ServerWrap<S>, mut free: F)
    where
        S: Server,
        F: FnMut(&mut S, Id) + Send,
    {
        let ids = std::mem::take(&mut *self.cached.lock());
        if ids.is_empty() {
            return;
        }
        wrap.call_sync(move |server| {
            // Cache order is reversed creation order.
            for id in ids.into_iter().rev() {
                free(server, id);
            }
        });
    }
}
