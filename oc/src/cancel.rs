//! Cancellation context
//!
//! A watch-channel token passed through the interpreter to every suspension
//! point: child waits, poll sleeps, and retry delays. Wired to ctrl-c in the
//! binary entry point.

use tokio::sync::watch;
use tracing::debug;

/// Sender half. Dropping it without cancelling leaves tokens pending forever.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn cancel(&self) {
        debug!("cancellation requested");
        let _ = self.tx.send(true);
    }
}

/// Receiver half, cheap to clone and observe.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    /// A token that can never fire, for tests and dry runs.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        CancelToken { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Source dropped without cancelling; stay pending.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_observed() {
        let (source, token) = CancelToken::new();
        assert!(!token.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        // Resolves immediately once cancelled
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = CancelToken::never();
        let result = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_err(), "never token must not resolve");
    }

    #[tokio::test]
    async fn test_clone_sees_cancel() {
        let (source, token) = CancelToken::new();
        let clone = token.clone();
        source.cancel();
        assert!(clone.is_cancelled());
    }
}
