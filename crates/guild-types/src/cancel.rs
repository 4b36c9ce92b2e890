//! Cooperative cancellation
//!
//! Every long-running operation in the core (LLM invocation, gate
//! evaluation, persistent-retry loops, the executor's continuous run)
//! accepts a [`CancelToken`]. Cancellation is cooperative: the holder
//! checks the token at suspension points and unwinds to a safe state,
//! releasing claimed work back to queued rather than failing it.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Why a cancelled operation stopped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<DateTime<Utc>>,
}

/// Cloneable cancellation handle shared between an operation and its
/// initiator. All clones observe the same flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline: None,
            }),
        }
    }

    /// A token that also fires once `deadline` passes.
    pub fn with_deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline: Some(deadline),
            }),
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.inner
            .deadline
            .map(|d| Utc::now() >= d)
            .unwrap_or(false)
    }

    /// Error if the operation should stop now.
    pub fn check(&self) -> Result<(), CancelError> {
        if self.is_cancelled() {
            return Err(CancelError::Cancelled);
        }
        if self.deadline_exceeded() {
            return Err(CancelError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolve once the token is cancelled. Does not cover the
    /// deadline, which callers poll via [`CancelToken::check`].
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.check(), Err(CancelError::Cancelled));
    }

    #[test]
    fn past_deadline_fails_check() {
        let token = CancelToken::with_deadline(Utc::now() - Duration::seconds(1));
        assert_eq!(token.check(), Err(CancelError::DeadlineExceeded));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
    }
}
