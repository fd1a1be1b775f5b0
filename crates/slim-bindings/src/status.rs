//! Call status reported to the foreign side and panic containment.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};

use slim_session::{Result, SlimError};
use tracing::error;

use crate::buffer::SlimBuffer;
use crate::codec;

/// Call succeeded.
pub const CALL_SUCCESS: i8 = 0;
/// Call failed with an encoded error.
pub const CALL_ERROR: i8 = 1;
/// Call panicked.
pub const CALL_PANIC: i8 = 2;

/// Outcome of one call: `code` plus, on failure, an encoded error or a
/// UTF-8 panic message in `error_buf`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CallStatus {
    /// One of the `CALL_*` codes.
    pub code: i8,
    /// Error payload, empty on success.
    pub error_buf: SlimBuffer,
}

impl CallStatus {
    /// True when `code` is [`CALL_SUCCESS`].
    pub fn is_success(&self) -> bool {
        self.code == CALL_SUCCESS
    }

    /// Decodes the carried error, if any. Consumes the buffer.
    pub fn take_error(&mut self) -> Option<SlimError> {
        let buf = std::mem::take(&mut self.error_buf);
        let bytes = unsafe { buf.destroy_into_vec() };
        match self.code {
            CALL_SUCCESS => None,
            CALL_ERROR => Some(
                codec::lift::<SlimError>(&bytes)
                    .unwrap_or_else(|e| SlimError::InternalError(e.to_string())),
            ),
            _ => Some(SlimError::InternalError(format!(
                "panic: {}",
                String::from_utf8_lossy(&bytes)
            ))),
        }
    }
}

/// Value returned to the foreign side when a call does not succeed.
pub trait FfiDefault {
    /// Zero value for the type.
    fn ffi_default() -> Self;
}

macro_rules! zero_default {
    ($($t:ty),*) => {$(
        impl FfiDefault for $t {
            fn ffi_default() -> Self {
                Default::default()
            }
        }
    )*};
}

zero_default!((), bool, i8, u8, i16, u16, i32, u32, i64, u64);

impl FfiDefault for *const c_void {
    fn ffi_default() -> Self {
        std::ptr::null()
    }
}

impl FfiDefault for SlimBuffer {
    fn ffi_default() -> Self {
        SlimBuffer::empty()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `f`, recording its outcome in `status`. Errors are encoded with the
/// wire codec; panics are caught and reported with code 2.
pub fn rust_call<T, F>(status: &mut CallStatus, f: F) -> T
where
    T: FfiDefault,
    F: FnOnce() -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => {
            status.code = CALL_SUCCESS;
            value
        }
        Ok(Err(err)) => {
            status.code = CALL_ERROR;
            status.error_buf = match codec::lower(&err) {
                Ok(bytes) => SlimBuffer::from_vec(bytes),
                Err(_) => SlimBuffer::empty(),
            };
            T::ffi_default()
        }
        Err(payload) => {
            status.code = CALL_PANIC;
            // Formatting the message may itself panic; report an empty buffer then.
            status.error_buf = panic::catch_unwind(AssertUnwindSafe(|| {
                let message = panic_message(payload.as_ref());
                error!(message = %message, "panic at the foreign boundary");
                SlimBuffer::from_vec(message.into_bytes())
            }))
            .unwrap_or_else(|_| SlimBuffer::empty());
            T::ffi_default()
        }
    }
}
