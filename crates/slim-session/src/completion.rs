//! Single-shot completion handles for delivery confirmations and membership
//! changes.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, SlimError};

/// Sending half, owned by the operation that will resolve the handle.
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<Result<()>>,
}

impl CompletionSender {
    /// Resolves the handle. A handle nobody waits on anymore is ignored.
    pub fn complete(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}

/// A pending result that may be waited on exactly once.
///
/// Both `wait` and `wait_for` consume the handle, including when `wait_for`
/// times out.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

/// Creates a linked sender and handle.
pub fn completion() -> (CompletionSender, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    (
        CompletionSender { tx },
        CompletionHandle {
            rx: Mutex::new(Some(rx)),
        },
    )
}

impl CompletionHandle {
    /// A handle that is already resolved.
    pub fn ready(result: Result<()>) -> Self {
        let (tx, handle) = completion();
        tx.complete(result);
        handle
    }

    fn take(&self) -> Result<oneshot::Receiver<Result<()>>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| SlimError::InvalidArgument("handle already consumed".to_string()))
    }

    /// True once `wait` or `wait_for` has taken the result.
    pub fn is_consumed(&self) -> bool {
        self.rx.lock().is_none()
    }

    /// Waits for the outcome. A second call fails with `InvalidArgument`.
    pub async fn wait(&self) -> Result<()> {
        let rx = self.take()?;
        rx.await
            .unwrap_or_else(|_| Err(SlimError::InternalError("operation abandoned".to_string())))
    }

    /// Like [`CompletionHandle::wait`] but gives up with `Timeout`.
    pub async fn wait_for(&self, timeout: Duration) -> Result<()> {
        let rx = self.take()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => result.unwrap_or_else(|_| {
                Err(SlimError::InternalError("operation abandoned".to_string()))
            }),
            Err(_) => Err(SlimError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_result_once() {
        let (tx, handle) = completion();
        tx.complete(Ok(()));
        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(
            handle.wait().await,
            Err(SlimError::InvalidArgument("handle already consumed".to_string()))
        );
        assert!(handle.is_consumed());
    }

    #[tokio::test]
    async fn test_wait_reports_error() {
        let handle = CompletionHandle::ready(Err(SlimError::SendError("x".into())));
        assert_eq!(handle.wait().await, Err(SlimError::SendError("x".into())));
    }

    #[tokio::test]
    async fn test_wait_for_timeout_consumes() {
        let (_tx, handle) = completion();
        assert_eq!(
            handle.wait_for(Duration::from_millis(20)).await,
            Err(SlimError::Timeout)
        );
        assert!(matches!(
            handle.wait().await,
            Err(SlimError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_resolves_before_deadline() {
        let (tx, handle) = completion();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.complete(Ok(()));
        });
        assert_eq!(handle.wait_for(Duration::from_secs(5)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_internal_error() {
        let (tx, handle) = completion();
        drop(tx);
        assert!(matches!(
            handle.wait().await,
            Err(SlimError::InternalError(_))
        ));
    }
}
