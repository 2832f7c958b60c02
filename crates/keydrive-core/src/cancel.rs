//! Operator cancellation.
//!
//! The CLI flips the token from its signal handler; the state machines poll
//! it between steps so rollback and scoped release still run.

use crate::error::{KeydriveError, KeydriveResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from a signal handler.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> KeydriveResult<()> {
        if self.is_cancelled() {
            Err(KeydriveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(token.checkpoint().is_ok());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.checkpoint(), Err(KeydriveError::Cancelled)));
    }
}
