use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MatchError;

/// Cooperative cancellation probe shared between a solve and its caller.
///
/// Cloning yields a handle to the same flag. Solvers check the probe at
/// their iteration boundaries and return [`MatchError::Cancelled`] without
/// emitting a partial assignment.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the solve holding the other handle.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), MatchError> {
        if self.is_cancelled() {
            Err(MatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}
