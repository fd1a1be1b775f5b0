//! Process-wide runtime driving every native operation.

use std::future::Future;
use std::sync::OnceLock;

use slim_session::{Result, SlimError};
use tokio::runtime::{Builder, Runtime};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The shared multi-threaded runtime, built on first use.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        match Builder::new_multi_thread()
            .enable_all()
            .thread_name("slim-bindings")
            .build()
        {
            Ok(rt) => rt,
            Err(e) => panic!("failed to start the bindings runtime: {}", e),
        }
    })
}

/// Runs `fut` on the shared runtime and parks the calling thread until it
/// finishes.
pub fn block_on<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    runtime().spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv()
        .unwrap_or_else(|_| Err(SlimError::InternalError("operation aborted".to_string())))
}
