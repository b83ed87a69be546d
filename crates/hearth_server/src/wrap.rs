//! # Threaded Server Wrapper
//!
//! Owns a [`Server`] and routes every call to it through a [`CommandQueue`]
//! drained by a dedicated thread.
//!
//! ```text
//! Main thread                         Server thread
//! ───────────                         ─────────────
//! call(f)        ──push──►  ┌───────┐
//! call_sync(f)   ──push──►  │ queue │ ──wait_and_flush_one──► f(&mut server)
//! draw(..)       ──push──►  └───────┘
//!      ▲                                        │
//!      └────────── sync slot posted ◄───────────┘
//! ```
//!
//! In direct mode there is no thread: calls run inline on the caller.
//!
//! ## Re-entrancy
//!
//! A command already holds the server while it runs. Calls made from inside
//! one (on the server thread) cannot run inline: fire-and-forget calls are
//! queued behind the current command, synchronous ones panic.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use hearth_core::{CommandQueue, QueueStats};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::server::Server;

/// Name given to the spawned server thread.
pub const SERVER_THREAD_NAME: &str = "hearth-server";

/// State shared between the wrapper and its server thread.
struct Shared<S> {
    server: Mutex<S>,
    queue: CommandQueue,
    exit: AtomicBool,
    /// Draw and sync requests queued but not yet consumed.
    draw_pending: AtomicU32,
    frames_drawn: AtomicU64,
    server_thread: OnceLock<ThreadId>,
}

impl<S: Server> Shared<S> {
    fn thread_loop(self: Arc<Self>, ready: crossbeam_channel::Sender<()>) {
        let _ = self.server_thread.set(thread::current().id());
        self.server.lock().init();
        info!("server thread up");
        // The receiver only disappears if `start` itself went away.
        let _ = ready.send(());
        drop(ready);

        let _unwind = DiscardOnUnwind(&self.queue);
        while !self.exit.load(Ordering::Acquire) {
            self.queue.wait_and_flush_one();
        }
        self.queue.flush_all();
        self.server.lock().finish();
        info!(
            frames = self.frames_drawn.load(Ordering::Relaxed),
            "server thread down"
        );
    }

    fn draw_now(&self, swap_buffers: bool, frame_step: f64) {
        self.server.lock().draw(swap_buffers, frame_step);
        self.frames_drawn.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drops the commands queued behind one that panicked, waking their callers
/// and releasing the `Shared` clones they captured.
struct DiscardOnUnwind<'q>(&'q CommandQueue);

impl Drop for DiscardOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let discarded = self.0.discard_pending();
            error!(discarded, "server thread panicked");
        }
    }
}

/// A server driven from other threads through a command queue.
///
/// # Example
///
/// ```rust
/// use hearth_server::{Server, ServerConfig, ServerWrap};
///
/// #[derive(Default)]
/// struct Counter {
///     value: u64,
/// }
///
/// impl Server for Counter {
///     fn draw(&mut self, _swap_buffers: bool, _frame_step: f64) {}
/// }
///
/// let wrap = ServerWrap::start(Counter::default(), ServerConfig::default()).unwrap();
/// wrap.call(|server| server.value += 1);
/// assert_eq!(wrap.call_ret(|server| server.value), 1);
/// let counter = wrap.finish();
/// assert_eq!(counter.value, 1);
/// ```
pub struct ServerWrap<S: Server> {
    shared: Arc<Shared<S>>,
    thread: Option<JoinHandle<()>>,
    config: ServerConfig,
    finished: bool,
}

impl<S: Server> ServerWrap<S> {
    /// Takes ownership of `server` and starts it.
    ///
    /// Threaded mode returns once the server thread has run
    /// [`Server::init`]. Direct mode calls `init` inline.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid, the queue cannot be
    /// allocated, or the server thread cannot be spawned or dies during
    /// `init`.
    pub fn start(server: S, config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            server: Mutex::new(server),
            queue: CommandQueue::new(config.effective_queue())?,
            exit: AtomicBool::new(false),
            draw_pending: AtomicU32::new(0),
            frames_drawn: AtomicU64::new(0),
            server_thread: OnceLock::new(),
        });

        let thread = if config.threaded {
            let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
            let thread_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(SERVER_THREAD_NAME.to_string())
                .spawn(move || thread_shared.thread_loop(ready_tx))
                .map_err(ServerError::Spawn)?;
            if ready_rx.recv().is_err() {
                let _ = handle.join();
                return Err(ServerError::ThreadExited);
            }
            Some(handle)
        } else {
            let _ = shared.server_thread.set(thread::current().id());
            shared.server.lock().init();
            info!("server running in direct mode");
            None
        };

        Ok(Self {
            shared,
            thread,
            config,
            finished: false,
        })
    }

    /// Configuration this wrapper was started with.
    #[must_use]
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns true if the server runs on its own thread.
    #[must_use]
    #[inline]
    pub fn is_threaded(&self) -> bool {
        self.config.threaded
    }

    /// Returns true if the caller is the thread that owns the server.
    #[must_use]
    pub fn is_server_thread(&self) -> bool {
        self.shared.server_thread.get() == Some(&thread::current().id())
    }

    /// Frames actually handed to [`Server::draw`].
    #[must_use]
    pub fn frames_drawn(&self) -> u64 {
        self.shared.frames_drawn.load(Ordering::Relaxed)
    }

    /// Counters of the underlying command queue.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.stats()
    }

    /// Runs `func` on the server without waiting for it.
    pub fn call<F>(&self, func: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.runs_inline() {
            if let Some(mut server) = self.shared.server.try_lock() {
                func(&mut server);
                drop(server);
                self.flush_deferred();
                return;
            }
            debug!("server busy on its own thread, deferring call");
        }
        let shared = Arc::clone(&self.shared);
        self.shared
            .queue
            .push(move || func(&mut shared.server.lock()));
    }

    /// Runs `func` on the server and waits for it to finish.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a command already running on the server.
    pub fn call_sync<F>(&self, func: F)
    where
        F: FnOnce(&mut S) + Send,
    {
        self.call_ret(func);
    }

    /// Runs `func` on the server and returns its result.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a command already running on the server,
    /// or if `func` panicked on the server thread.
    pub fn call_ret<R, F>(&self, func: F) -> R
    where
        R: Send,
        F: FnOnce(&mut S) -> R + Send,
    {
        if self.runs_inline() {
            let Some(mut server) = self.shared.server.try_lock() else {
                panic!("synchronous server call made from inside a running server command");
            };
            let result = func(&mut server);
            drop(server);
            self.flush_deferred();
            return result;
        }
        let server = &self.shared.server;
        self.shared.queue.push_and_ret(|| func(&mut server.lock()))
    }

    /// Requests a frame.
    ///
    /// Requests that pile up before the server gets to them are coalesced:
    /// each queued draw only reaches [`Server::draw`] if no newer draw or
    /// sync was queued after it.
    pub fn draw(&self, swap_buffers: bool, frame_step: f64) {
        if !self.config.threaded {
            self.flush_deferred();
            self.shared.draw_now(swap_buffers, frame_step);
            return;
        }
        self.shared.draw_pending.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        self.shared.queue.push(move || {
            if shared.draw_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                shared.draw_now(swap_buffers, frame_step);
            }
        });
    }

    /// Blocks until every command queued so far has run.
    ///
    /// Draws still queued at this point are skipped: a sync counts as a newer
    /// frame request for coalescing.
    ///
    /// # Panics
    ///
    /// Panics if called on the server thread in threaded mode.
    pub fn sync(&self) {
        if !self.config.threaded {
            self.flush_deferred();
            return;
        }
        assert!(
            !self.is_server_thread(),
            "sync called from the server thread would wait on itself"
        );
        self.shared.draw_pending.fetch_add(1, Ordering::AcqRel);
        let pending = &self.shared.draw_pending;
        self.shared.queue.push_and_sync(|| {
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Stops the server and hands it back.
    ///
    /// Threaded mode queues an exit command behind everything already
    /// pushed, joins the thread and returns the server after its
    /// [`Server::finish`] ran there.
    ///
    /// If the server thread died on a panicking command, the server is
    /// returned as the panic left it and `finish` has not run on it.
    #[must_use]
    pub fn finish(mut self) -> S {
        self.stop();
        let shared = Arc::clone(&self.shared);
        drop(self);
        // The thread is joined and nothing is left queued, so no command
        // still holds a clone.
        match Arc::try_unwrap(shared) {
            Ok(shared) => shared.server.into_inner(),
            Err(_) => unreachable!("server state still shared after its thread was joined"),
        }
    }

    fn runs_inline(&self) -> bool {
        !self.config.threaded || self.is_server_thread()
    }

    /// Direct mode only: runs calls that were deferred by re-entrancy.
    fn flush_deferred(&self) {
        if !self.config.threaded {
            self.shared.queue.flush_all();
        }
    }

    fn stop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.thread.take() {
            Some(handle) => {
                if !handle.is_finished() {
                    let shared = Arc::clone(&self.shared);
                    self.shared
                        .queue
                        .push(move || shared.exit.store(true, Ordering::Release));
                }
                if handle.join().is_err() {
                    // Anything pushed after the thread died, the exit command
                    // included.
                    self.shared.queue.discard_pending();
                }
            }
            None => {
                self.flush_deferred();
                self.shared.server.lock().finish();
                info!(
                    frames = self.shared.frames_drawn.load(Ordering::Relaxed),
                    "direct-mode server finished"
                );
            }
        }
    }
}

impl<S: Server> Drop for ServerWrap<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: Server> std::fmt::Debug for ServerWrap<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWrap")
            .field("threaded", &self.config.threaded)
            .field("frames_drawn", &self.frames_drawn())
            .field("queue", &self.shared.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tally {
        inits: u32,
        finishes: u32,
        draws: Vec<f64>,
        thread: Option<ThreadId>,
    }

    impl Server for Tally {
        fn init(&mut self) {
            self.inits += 1;
            self.thread = Some(thread::current().id());
        }

        fn finish(&mut self) {
            self.finishes += 1;
        }

        fn draw(&mut self, _swap_buffers: bool, frame_step: f64) {
            self.draws.push(frame_step);
        }
    }

    #[test]
    fn test_threaded_lifecycle() {
        let wrap = ServerWrap::start(Tally::default(), ServerConfig::default()).unwrap();
        assert!(wrap.is_threaded());
        assert!(!wrap.is_server_thread());

        let on_server = wrap.call_ret(|tally| tally.thread);
        assert_ne!(on_server, Some(thread::current().id()));

        let tally = wrap.finish();
        assert_eq!(tally.inits, 1);
        assert_eq!(tally.finishes, 1);
    }

    #[test]
    fn test_direct_mode_runs_inline() {
        let wrap = ServerWrap::start(Tally::default(), ServerConfig::direct()).unwrap();
        assert!(wrap.is_server_thread());

        wrap.call(|tally| tally.draws.push(-1.0));
        assert_eq!(wrap.call_ret(|tally| tally.draws.len()), 1);
        wrap.draw(true, 0.5);
        wrap.sync();
        assert_eq!(wrap.frames_drawn(), 1);
        assert_eq!(wrap.queue_stats().pushed, 0);

        let tally = wrap.finish();
        assert_eq!(tally.thread, Some(thread::current().id()));
        assert_eq!(tally.draws, vec![-1.0, 0.5]);
        assert_eq!(tally.finishes, 1);
    }

    #[test]
    fn test_drop_stops_thread() {
        let wrap = ServerWrap::start(Tally::default(), ServerConfig::default()).unwrap();
        wrap.call(|tally| tally.inits += 10);
        drop(wrap);
    }
}
