use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::DumpAsyncError;

/// Cooperative cancellation, polled between heap objects and render steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), DumpAsyncError> {
        if self.is_cancelled() {
            return Err(DumpAsyncError::Cancelled);
        }
        Ok(())
    }
}
