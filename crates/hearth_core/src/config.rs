//! # Queue Configuration
//!
//! Tunables for [`CommandQueue`](crate::sync::CommandQueue). Loaded once at
//! startup, either built in code or parsed from TOML:
//!
//! ```toml
//! arena_size = 262144
//! sync_slots = 8
//! use_signal_semaphore = true
//! ```

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// Alignment of every record in the command arena, in bytes.
pub const RECORD_ALIGN: usize = 8;

/// Default arena size: 256 KiB.
pub const DEFAULT_ARENA_SIZE: usize = 256 * 1024;

/// Default number of sync slots (maximum concurrent `push_and_sync` callers).
pub const DEFAULT_SYNC_SLOTS: usize = 8;

/// Smallest arena accepted by [`QueueConfig::validate`].
pub const MIN_ARENA_SIZE: usize = 64;

/// Largest arena accepted. Record sizes are stored shifted left by one in a
/// `u32` header, so offsets must stay below 2^31.
pub const MAX_ARENA_SIZE: usize = 1 << 31;

/// Configuration for a command queue.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Size of the command arena in bytes. Must be a multiple of
    /// [`RECORD_ALIGN`].
    pub arena_size: usize,
    /// Number of sync slots in the pool.
    pub sync_slots: usize,
    /// When true, pushes post a counting semaphore so the consumer can sleep
    /// in `wait_and_flush_one`. When false the consumer polls `flush_all`.
    pub use_signal_semaphore: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            sync_slots: DEFAULT_SYNC_SLOTS,
            use_signal_semaphore: false,
        }
    }
}

impl QueueConfig {
    /// Config for a consumer thread that sleeps until work arrives.
    #[must_use]
    pub fn signalled() -> Self {
        Self {
            use_signal_semaphore: true,
            ..Self::default()
        }
    }

    /// Returns a copy with a different arena size.
    #[must_use]
    pub fn with_arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Returns a copy with a different sync slot count.
    #[must_use]
    pub fn with_sync_slots(mut self, sync_slots: usize) -> Self {
        self.sync_slots = sync_slots;
        self
    }

    /// Checks every field against the queue's structural limits.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> CoreResult<()> {
        if self.arena_size < MIN_ARENA_SIZE {
            return Err(CoreError::InvalidConfig(format!(
                "arena_size {} is below the minimum of {MIN_ARENA_SIZE} bytes",
                self.arena_size
            )));
        }
        if self.arena_size >= MAX_ARENA_SIZE {
            return Err(CoreError::InvalidConfig(format!(
                "arena_size {} must be below {MAX_ARENA_SIZE} bytes",
                self.arena_size
            )));
        }
        if self.arena_size % RECORD_ALIGN != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "arena_size {} is not a multiple of {RECORD_ALIGN}",
                self.arena_size
            )));
        }
        if self.sync_slots == 0 {
            return Err(CoreError::InvalidConfig(
                "sync_slots must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a config from TOML text. Missing keys take their
    /// default values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] on malformed TOML, unknown keys,
    /// or values that fail [`QueueConfig::validate`].
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
