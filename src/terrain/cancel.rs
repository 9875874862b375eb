use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a requester and the work it started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Canceled)` once the token has fired
    pub fn check(&self) -> crate::error::ElevationResult<()> {
        if self.is_canceled() {
            Err(crate::error::ElevationError::Canceled)
        } else {
            Ok(())
        }
    }
}
