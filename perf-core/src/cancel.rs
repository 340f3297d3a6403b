//! Cancellation token threaded through long-running operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{PerfError, Result};

/// A cloneable cancellation flag. Cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Err(`Cancelled`) once the token has been cancelled; used at
    /// suspension points and between chunks of CPU work.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PerfError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(PerfError::Cancelled)));
        token.reset();
        assert!(clone.check().is_ok());
    }
}
