//! Cooperative cancellation of a unified GC episode

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared interruption flag.
///
/// Clones observe the same flag. Writers publish with release ordering and
/// readers poll with acquire ordering, so a request is seen at the next poll.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
}

impl InterruptToken {
    /// Create a cleared token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether interruption was requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clear the flag; returns whether it was set
    pub fn clear(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}
