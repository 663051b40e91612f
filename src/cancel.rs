use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{CiWaitError, Result};

/// Create a linked cancellation pair. The handle is held by whoever decides
/// to stop the wait (the ctrl-c listener); tokens are cloned into every task
/// and loop that must observe it.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cooperative cancellation observer shared by the wait loop and its
/// background tasks. Every blocking point in the loop selects against it.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Resolves once cancellation is requested. Also resolves if the handle
    /// was dropped, so orphaned tasks never hang.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep the full duration or return `Err(Cancelled)` early.
    pub async fn sleep(&self, dur: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancelled() => Err(CiWaitError::Cancelled),
            _ = tokio::time::sleep(dur) => Ok(()),
        }
    }

    /// Run a fallible future, abandoning it with `Err(Cancelled)` if
    /// cancellation wins the race.
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancelled() => Err(CiWaitError::Cancelled),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancellation() {
        let (_handle, token) = cancel_pair();
        assert!(token.sleep(Duration::from_secs(3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_early_on_cancel() {
        let (handle, token) = cancel_pair();
        let sleeper = tokio::spawn(async move { token.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let res = sleeper.await.unwrap();
        assert!(res.unwrap_err().is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn guard_prefers_cancellation_over_slow_work() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        let res: Result<()> = token
            .guard(async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(())
            })
            .await;
        assert!(res.unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_cancelled() {
        let (handle, token) = cancel_pair();
        drop(handle);
        // must not hang
        token.cancelled().await;
    }
}
