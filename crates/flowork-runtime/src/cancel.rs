//! Cooperative cancellation shared between the runtime and components.
//!
//! A `CancellationToken` is the stop signal of a workflow run, the shutdown
//! signal of the reconciler task and the per-attempt signal the retry
//! behavior fires on timeout. Components poll it or await
//! [`CancellationToken::cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token for cooperative cancellation of async operations.
///
/// Clones share state: when `cancel()` is called on any clone, all clones
/// observe the cancellation.
///
/// # Example
///
/// ```
/// use flowork_runtime::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
    /// States of every ancestor token, nearest last.
    ancestors: Vec<Arc<TokenState>>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every task awaiting [`Self::cancelled`].
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Check if cancellation has been requested on this token or an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
            || self
                .ancestors
                .iter()
                .any(|ancestor| ancestor.cancelled.load(Ordering::SeqCst))
    }

    /// Create a child token.
    ///
    /// The child observes cancellation of its ancestors, but cancelling the
    /// child leaves them untouched. The retry behavior uses this to abort a
    /// single attempt without stopping the whole workflow.
    pub fn child_token(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.state));
        Self {
            state: Arc::new(TokenState::default()),
            ancestors,
        }
    }

    /// Wait until the token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let mut waiters: Vec<_> = std::iter::once(&self.state)
                .chain(self.ancestors.iter())
                .map(|state| Box::pin(state.notify.notified()))
                .collect();
            for waiter in waiters.iter_mut() {
                waiter.as_mut().enable();
            }

            if self.is_cancelled() {
                return;
            }
            futures::future::select_all(waiters).await;

            if self.is_cancelled() {
                return;
            }
        }
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::RuntimeError {
    fn from(_: CancelledError) -> Self {
        crate::error::RuntimeError::Cancelled
    }
}

impl From<CancelledError> for crate::error::ExecutionFailure {
    fn from(_: CancelledError) -> Self {
        crate::error::ExecutionFailure::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
        assert!(token2.check().is_err());
    }

    #[test]
    fn test_child_observes_parent_only() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other_child = parent.child_token();
        let grandchild = other_child.child_token();
        parent.cancel();
        assert!(other_child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_wakes_on_parent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let handle = tokio::spawn(async move { child.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("child should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("should not block");
    }

    #[test]
    fn test_cancelled_error_display() {
        assert_eq!(CancelledError.to_string(), "Operation was cancelled");
    }
}
