// ABOUTME: Cancellation token checked at every suspension point
// ABOUTME: Cloneable handle over a shared flag; cancellation surfaces as a typed error

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

/// Error returned from any operation that observed cancellation.
///
/// Recover it from an `anyhow::Error` chain with `is_cancelled` to tell a
/// deliberate stop apart from a real failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("switchover cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Returns true if the error chain bottoms out in a [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

/// Shared cancellation signal.
///
/// The switchover driver hands a clone to every loop; loops call
/// [`CancellationToken::check`] at the top of each iteration and before each
/// database round-trip. Once cancelled a token never resets.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_token_starts_clear() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check().is_err());
    }

    #[test]
    fn test_cancelled_survives_context_wrapping() {
        let token = CancellationToken::new();
        token.cancel();
        let err = token
            .check()
            .context("sync changes")
            .context("execute")
            .unwrap_err();
        assert!(is_cancelled(&err));
    }
}
