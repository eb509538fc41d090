//! VM error types

use otter_unified_gc::{GcError, TaggedValue};
use thiserror::Error;

/// VM execution errors.
///
/// An `Err` is the pending exception: every call that can raise one returns
/// a `VmResult` and callers propagate it with `?`.
#[derive(Debug, Error)]
pub enum VmError {
    /// Type error (e.g., incompatible receiver)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Range error
    #[error("RangeError: {0}")]
    RangeError(String),

    /// Internal error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Thrown JS exception (e.g. from a proxy trap or a callback)
    #[error("Uncaught exception: {0:?}")]
    Exception(TaggedValue),

    /// Collector failure surfaced to managed code
    #[error(transparent)]
    Gc(#[from] GcError),
}

impl VmError {
    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a range error
    pub fn range_error(msg: impl Into<String>) -> Self {
        Self::RangeError(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Create an exception from a thrown value
    pub fn exception(value: TaggedValue) -> Self {
        Self::Exception(value)
    }

    /// `TypeError` raised by a builtin called on the wrong kind of receiver
    pub fn incompatible_receiver(method: &str) -> Self {
        Self::TypeError(format!("Method {method} called on incompatible receiver"))
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;
