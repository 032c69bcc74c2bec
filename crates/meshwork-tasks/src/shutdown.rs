//! Hierarchical cancellation tokens

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// A cloneable cancellation handle.
///
/// Clones share the same cancellation state. [`ShutdownToken::child`] creates
/// a token that is cancelled when its parent is cancelled, but whose own
/// cancellation does not propagate upwards.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    parent: Option<Arc<ShutdownToken>>,
}

impl ShutdownToken {
    /// Create a new root token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: None,
        }
    }

    /// Create a child token.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel this token and everything running under it.
    ///
    /// Idempotent: returns `true` only for the call that actually flipped the
    /// state, `false` for every later call.
    pub fn cancel(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Whether this token, or any of its ancestors, has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if *self.tx.borrow() {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Wait until this token or one of its ancestors is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.tx.subscribe();
            if *rx.borrow() {
                return;
            }
            match &self.parent {
                None => {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
                Some(parent) => {
                    tokio::select! {
                        _ = rx.wait_for(|cancelled| *cancelled) => {}
                        _ = parent.cancelled() => {}
                    }
                }
            }
        })
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let parent = ShutdownToken::new();
        let child = parent.child();

        parent.cancel();
        assert!(child.is_cancelled());

        // The wait side must resolve promptly too.
        tokio::time::timeout(Duration::from_millis(100), child.cancelled())
            .await
            .expect("child not released by parent cancel");
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = ShutdownToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = ShutdownToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter not woken")
            .expect("waiter panicked");
    }
}
