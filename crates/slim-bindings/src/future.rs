//! Futures driven by the foreign runtime through poll / complete / free.
//!
//! The native operation starts immediately on the shared runtime. `poll`
//! registers a continuation that is invoked with [`POLL_MAYBE_READY`] once
//! the result is available, or invokes it right away with [`POLL_READY`].
//! `complete` takes the result; `free` releases the handle. A freed future's
//! operation still runs to completion and its result is discarded, the same
//! as a blocking call whose caller went away.

use std::ffi::c_void;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use slim_session::{Result, SlimError};
use tracing::debug;

use crate::buffer::SlimBuffer;
use crate::handle::{arc_from_handle, arc_into_raw, free_handle};
use crate::runtime::runtime;
use crate::status::{rust_call, CallStatus};

/// The result can be taken with `complete`.
pub const POLL_READY: i8 = 0;
/// Poll again.
pub const POLL_MAYBE_READY: i8 = 1;

/// Wake-up callback registered by `poll`.
pub type ContinuationFn = extern "C" fn(data: u64, poll_result: i8);

struct FutureState<T> {
    result: Option<Result<T>>,
    done: bool,
    waiter: Option<(ContinuationFn, u64)>,
}

/// Native operation observed through poll, complete and free.
pub struct ForeignFuture<T> {
    state: Mutex<FutureState<T>>,
}

impl<T: Send + 'static> ForeignFuture<T> {
    /// Runs `fut` on the bindings runtime.
    pub fn spawn<F>(fut: F) -> Arc<Self>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let this = Arc::new(Self {
            state: Mutex::new(FutureState {
                result: None,
                done: false,
                waiter: None,
            }),
        });
        let rt = runtime();
        let work = rt.spawn(fut);
        let weak = Arc::downgrade(&this);
        rt.spawn(async move {
            let result = match work.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    Err(SlimError::InternalError("panic in async call".to_string()))
                }
                Err(_) => Err(SlimError::InternalError("async call cancelled".to_string())),
            };
            match weak.upgrade() {
                Some(this) => this.resolve(result),
                None => debug!("future freed before completion, result discarded"),
            }
        });
        this
    }

    fn resolve(&self, result: Result<T>) {
        let waiter = {
            let mut state = self.state.lock();
            state.result = Some(result);
            state.done = true;
            state.waiter.take()
        };
        if let Some((continuation, data)) = waiter {
            continuation(data, POLL_MAYBE_READY);
        }
    }

    /// Registers `continuation`, or calls it at once when already done.
    pub fn poll(&self, continuation: ContinuationFn, data: u64) {
        let ready = {
            let mut state = self.state.lock();
            if !state.done {
                state.waiter = Some((continuation, data));
            }
            state.done
        };
        if ready {
            continuation(data, POLL_READY);
        }
    }

    /// True once the operation has finished.
    pub fn is_ready(&self) -> bool {
        self.state.lock().done
    }

    /// Takes the result. Fails if not ready or already taken.
    pub fn complete(&self) -> Result<T> {
        let mut state = self.state.lock();
        if !state.done {
            return Err(SlimError::InternalError("future not ready".to_string()));
        }
        state
            .result
            .take()
            .unwrap_or_else(|| Err(SlimError::InternalError("future already completed".to_string())))
    }

    /// Forgets the registered continuation. The operation keeps running.
    pub fn detach(&self) {
        self.state.lock().waiter = None;
    }
}

/// Starts `fut` and returns its foreign handle.
pub fn future_handle<T, F>(fut: F) -> *const c_void
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    arc_into_raw(ForeignFuture::spawn(fut))
}

macro_rules! future_family {
    ($t:ty => $ret:ty, $convert:expr; $poll:ident, $complete:ident, $free:ident) => {
        /// # Safety
        /// `handle` must be a live future handle of this result kind.
        #[no_mangle]
        pub unsafe extern "C" fn $poll(handle: *const c_void, continuation: ContinuationFn, data: u64) {
            let fut = arc_from_handle::<ForeignFuture<$t>>(handle);
            fut.poll(continuation, data);
        }

        /// # Safety
        /// `handle` must be a live future handle of this result kind.
        #[no_mangle]
        pub unsafe extern "C" fn $complete(handle: *const c_void, status: &mut CallStatus) -> $ret {
            let fut = arc_from_handle::<ForeignFuture<$t>>(handle);
            rust_call(status, || fut.complete().map($convert))
        }

        /// # Safety
        /// `handle` must be a live future handle of this result kind; it is
        /// invalid afterwards.
        #[no_mangle]
        pub unsafe extern "C" fn $free(handle: *const c_void) {
            arc_from_handle::<ForeignFuture<$t>>(handle).detach();
            free_handle::<ForeignFuture<$t>>(handle);
        }
    };
}

future_family!(() => (), |v| v;
    slim_bindings_future_poll_void, slim_bindings_future_complete_void, slim_bindings_future_free_void);
future_family!(u32 => u32, |v| v;
    slim_bindings_future_poll_u32, slim_bindings_future_complete_u32, slim_bindings_future_free_u32);
future_family!(u64 => u64, |v| v;
    slim_bindings_future_poll_u64, slim_bindings_future_complete_u64, slim_bindings_future_free_u64);
future_family!(usize => *const c_void, |v| v as *const c_void;
    slim_bindings_future_poll_pointer, slim_bindings_future_complete_pointer, slim_bindings_future_free_pointer);
future_family!(Vec<u8> => SlimBuffer, SlimBuffer::from_vec;
    slim_bindings_future_poll_buffer, slim_bindings_future_complete_buffer, slim_bindings_future_free_buffer);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI8, Ordering};
    use std::time::Duration;

    static LAST_POLL: AtomicI8 = AtomicI8::new(-1);

    extern "C" fn record(_data: u64, poll_result: i8) {
        LAST_POLL.store(poll_result, Ordering::SeqCst);
    }

    extern "C" fn ignore(_data: u64, _poll_result: i8) {}

    fn wait_ready<T: Send + 'static>(fut: &ForeignFuture<T>) {
        for _ in 0..500 {
            if fut.is_ready() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("future never became ready");
    }

    #[test]
    fn test_poll_then_complete() {
        let handle = future_handle(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(7u32)
        });
        unsafe {
            let fut = arc_from_handle::<ForeignFuture<u32>>(handle);
            wait_ready(&fut);
            slim_bindings_future_poll_u32(handle, record, 1);
            assert_eq!(LAST_POLL.load(Ordering::SeqCst), POLL_READY);

            let mut status = CallStatus::default();
            assert_eq!(slim_bindings_future_complete_u32(handle, &mut status), 7);
            assert!(status.is_success());

            let mut status = CallStatus::default();
            slim_bindings_future_complete_u32(handle, &mut status);
            assert!(matches!(status.take_error(), Some(SlimError::InternalError(_))));
            drop(fut);
            slim_bindings_future_free_u32(handle);
        }
    }

    #[test]
    fn test_error_result() {
        let fut = ForeignFuture::<()>::spawn(async { Err(SlimError::Timeout) });
        wait_ready(&fut);
        assert_eq!(fut.complete(), Err(SlimError::Timeout));
    }

    #[test]
    fn test_buffer_kind() {
        let handle = future_handle(async { Ok(vec![1u8, 2, 3]) });
        unsafe {
            let fut = arc_from_handle::<ForeignFuture<Vec<u8>>>(handle);
            wait_ready(&fut);
            drop(fut);
            let mut status = CallStatus::default();
            let buf = slim_bindings_future_complete_buffer(handle, &mut status);
            assert_eq!(buf.destroy_into_vec(), vec![1, 2, 3]);
            slim_bindings_future_free_buffer(handle);
        }
    }

    #[test]
    fn test_free_lets_operation_finish() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = finished.clone();
        let handle = future_handle(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        unsafe {
            slim_bindings_future_poll_void(handle, ignore, 2);
            slim_bindings_future_free_void(handle);
        }
        for _ in 0..500 {
            if finished.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("operation did not run to completion after free");
    }
}
