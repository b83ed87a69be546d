//! # Server Configuration
//!
//! Loaded from TOML at startup:
//!
//! ```toml
//! threaded = true
//! id_pool_size = 60
//!
//! [queue]
//! arena_size = 262144
//! sync_slots = 8
//! ```

use hearth_core::QueueConfig;
use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

/// Ids fetched per refill of an [`IdPool`](crate::IdPool).
pub const DEFAULT_ID_POOL_SIZE: usize = 60;

/// Configuration for a [`ServerWrap`](crate::ServerWrap).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Run the server on a dedicated thread. When false every call runs
    /// inline on the caller.
    pub threaded: bool,
    /// Ids fetched per id-pool refill.
    pub id_pool_size: usize,
    /// Command queue settings.
    pub queue: QueueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            id_pool_size: DEFAULT_ID_POOL_SIZE,
            queue: QueueConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config that runs the server inline on the caller's thread.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            threaded: false,
            ..Self::default()
        }
    }

    /// Queue config actually used: a server thread always sleeps on the
    /// signalling semaphore.
    #[must_use]
    pub fn effective_queue(&self) -> QueueConfig {
        let mut queue = self.queue.clone();
        queue.use_signal_semaphore |= self.threaded;
        queue
    }

    /// Validates this config and the nested queue config.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidConfig`] for a zero id pool size and
    /// [`ServerError::Core`] for a bad queue config.
    pub fn validate(&self) -> ServerResult<()> {
        if self.id_pool_size == 0 {
            return Err(ServerError::InvalidConfig(
                "id_pool_size must be at least 1".to_string(),
            ));
        }
        self.queue.validate()?;
        Ok(())
    }

    /// Parses and validates a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidConfig`] on malformed TOML or unknown
    /// keys, and whatever [`ServerConfig::validate`] rejects.
    pub fn from_toml_str(text: &str) -> ServerResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ServerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.threaded);
        assert_eq!(config.id_pool_size, 60);
    }

    #[test]
    fn test_threaded_forces_signal_semaphore() {
        let config = ServerConfig::default();
        assert!(!config.queue.use_signal_semaphore);
        assert!(config.effective_queue().use_signal_semaphore);
        assert!(!ServerConfig::direct().effective_queue().use_signal_semaphore);
    }

    #[test]
    fn test_toml_nested_queue() {
        let config = ServerConfig::from_toml_str(
            r"
            threaded = false
            id_pool_size = 16

            [queue]
            arena_size = 4096
            ",
        )
        .unwrap();
        assert!(!config.threaded);
        assert_eq!(config.id_pool_size, 16);
        assert_eq!(config.queue.arena_size, 4096);
        assert_eq!(config.queue.sync_slots, QueueConfig::default().sync_slots);
    }

    #[test]
    fn test_toml_rejects_bad_values() {
        assert!(matches!(
            ServerConfig::from_toml_str("id_pool_size = 0"),
            Err(ServerError::InvalidConfig(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("[queue]\narena_size = 12"),
            Err(ServerError::Core(_))
        ));
        assert!(ServerConfig::from_toml_str("threads = 2").is_err());
    }
}
