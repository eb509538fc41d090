//! Collector error types

use thiserror::Error;

use crate::value::HeapId;

/// Recoverable collector errors.
///
/// Conditions that would risk heap corruption never surface here; they go
/// through [`fatal`] instead.
#[derive(Debug, Error)]
pub enum GcError {
    /// A companion VM is already linked to this VM
    #[error("companion VM handshake already performed")]
    HandshakeAlreadyDone,

    /// A unified GC episode is already active
    #[error("a unified GC episode is already in progress")]
    EpisodeInProgress,

    /// Heap reached its configured object capacity
    #[error("heap {heap:?} exhausted: capacity of {capacity} objects reached")]
    HeapExhausted {
        /// The heap
        heap: HeapId,
        /// Configured capacity
        capacity: usize,
    },

    /// The daemon thread has shut down
    #[error("daemon thread is not running")]
    DaemonStopped,

    /// Configuration could not be parsed
    #[error("invalid GC configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// The daemon thread could not be spawned
    #[error("failed to spawn daemon thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for collector operations
pub type GcResult<T> = std::result::Result<T, GcError>;

/// Report an unrecoverable collector condition and abort the process.
#[cold]
pub fn fatal(message: &str) -> ! {
    tracing::error!(target: "otter::gc", "fatal: {message}");
    std::process::abort()
}
