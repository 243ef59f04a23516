//! # Persistence Configuration
//!
//! Knobs for the SQLite substrate. Every field has a default, so most callers
//! use `PersistenceConfig::default()` and override one field with struct
//! update syntax:
//!
//! ```rust
//! use std::time::Duration;
//! use mutalog::PersistenceConfig;
//!
//! let config = PersistenceConfig {
//!     busy_timeout: Duration::from_secs(1),
//!     ..PersistenceConfig::default()
//! };
//! assert_eq!(config.compression_threshold, 512);
//! ```

use std::time::Duration;

/// Default time SQLite waits on a locked database before failing.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default encoded payload size (bytes) at which batch blobs get compressed.
const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

/// SQLite `synchronous` pragma setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronousMode {
    /// Sync the WAL on every commit. Survives power loss.
    Full,
    /// Sync at checkpoints only. Survives process crashes.
    Normal,
}

impl SynchronousMode {
    pub(crate) fn pragma_value(self) -> &'static str {
        match self {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
        }
    }
}

/// Configuration for [`Persistence`](crate::Persistence).
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// How long a transaction waits for a competing connection's lock.
    pub busy_timeout: Duration,

    /// Durability of commits.
    pub synchronous: SynchronousMode,

    /// Batch payloads of at least this many bytes are zstd-compressed.
    pub compression_threshold: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            synchronous: SynchronousMode::Normal,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}
