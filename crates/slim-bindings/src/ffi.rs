//! C ABI entry points.
//!
//! Arguments arrive as handles, scalars, or [`ForeignBytes`] holding a value
//! encoded with [`crate::codec`]. Results that are not scalars or handles are
//! returned as encoded [`SlimBuffer`]s. Blocking entry points report their
//! outcome in a [`CallStatus`]; `_async` entry points return a future handle
//! driven through the `slim_bindings_future_*` families.

use std::collections::HashMap;
use std::ffi::c_void;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slim_session::{
    AuthConfig, ClientConfig, JwtConfig, MessageContext, Name, Result, ServerConfig,
    SessionConfig, SlimError, SpireConfig,
};

use crate::adapter::{
    create_app, create_app_with_jwt, create_app_with_secret, create_app_with_spire,
    create_app_with_static_token, BindingsAdapter, BindingsSessionContext, FfiCompletionHandle,
};
use crate::buffer::{ForeignBytes, SlimBuffer};
use crate::codec::{self, duration_from_millis, Lift, Lower};
use crate::future::future_handle;
use crate::handle::{arc_from_handle, arc_into_raw, clone_handle, free_handle};
use crate::init::{initialize_crypto_provider, initialize_tracing};
use crate::status::{rust_call, CallStatus};

type Payload = (
    Vec<u8>,
    Option<String>,
    Option<HashMap<String, String>>,
);

unsafe fn lift_arg<T: Lift>(bytes: ForeignBytes) -> Result<T> {
    codec::lift(bytes.as_slice()?)
}

unsafe fn lift_payload(
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
) -> Result<Payload> {
    Ok((
        lift_arg(payload)?,
        lift_arg(payload_type)?,
        lift_arg(metadata)?,
    ))
}

fn lower_ret<T: Lower>(value: T) -> Result<SlimBuffer> {
    codec::lower(&value).map(SlimBuffer::from_vec)
}

unsafe fn object<T>(ptr: *const c_void) -> Result<Arc<T>> {
    if ptr.is_null() {
        return Err(SlimError::InvalidArgument("null handle".to_string()));
    }
    Ok(arc_from_handle::<T>(ptr))
}

fn into_handle<T: Send + Sync + 'static>(value: T) -> *const c_void {
    arc_into_raw(Arc::new(value))
}

/// Starts `fut` once its arguments were decoded; decoding failures resolve
/// the future with the error.
fn spawn_with<A, T, F, Fut>(args: Result<A>, f: F) -> *const c_void
where
    A: Send + 'static,
    T: Send + 'static,
    F: FnOnce(A) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    future_handle(async move { f(args?).await })
}

// Buffers

/// Allocates a zeroed buffer of `size` bytes.
#[no_mangle]
pub extern "C" fn slim_bindings_buffer_alloc(size: u64, status: &mut CallStatus) -> SlimBuffer {
    rust_call(status, || {
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s <= i32::MAX as usize)
            .ok_or_else(|| SlimError::InvalidArgument("buffer size exceeds i32::MAX".to_string()))?;
        Ok(SlimBuffer::from_vec(vec![0u8; size]))
    })
}

/// # Safety
/// `bytes` must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_buffer_from_bytes(
    bytes: ForeignBytes,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || Ok(SlimBuffer::from_vec(bytes.as_slice()?.to_vec())))
}

/// # Safety
/// `buf` must have been produced by this library and not freed yet.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_buffer_free(buf: SlimBuffer, status: &mut CallStatus) {
    rust_call(status, || {
        buf.destroy();
        Ok(())
    })
}

// Initialization

/// Installs the process-wide rustls crypto provider.
#[no_mangle]
pub extern "C" fn slim_bindings_initialize_crypto_provider(status: &mut CallStatus) {
    rust_call(status, || {
        initialize_crypto_provider();
        Ok(())
    })
}

/// # Safety
/// `filter` must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_initialize_tracing(
    filter: ForeignBytes,
    status: &mut CallStatus,
) {
    rust_call(status, || initialize_tracing(&lift_arg::<String>(filter)?))
}

// Factories

/// # Safety
/// Arguments must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_create_app(
    name: ForeignBytes,
    auth: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let adapter = create_app(lift_arg::<Name>(name)?, lift_arg::<AuthConfig>(auth)?)?;
        Ok(into_handle(adapter))
    })
}

/// # Safety
/// Arguments must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_create_app_with_secret(
    name: ForeignBytes,
    secret: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let adapter =
            create_app_with_secret(lift_arg::<Name>(name)?, lift_arg::<String>(secret)?)?;
        Ok(into_handle(adapter))
    })
}

/// # Safety
/// Arguments must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_create_app_with_static_token(
    name: ForeignBytes,
    token_file: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let adapter = create_app_with_static_token(
            lift_arg::<Name>(name)?,
            lift_arg::<PathBuf>(token_file)?,
        )?;
        Ok(into_handle(adapter))
    })
}

/// # Safety
/// Arguments must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_create_app_with_jwt(
    name: ForeignBytes,
    config: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let adapter =
            create_app_with_jwt(lift_arg::<Name>(name)?, lift_arg::<JwtConfig>(config)?)?;
        Ok(into_handle(adapter))
    })
}

/// # Safety
/// Arguments must describe readable memory for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_create_app_with_spire(
    name: ForeignBytes,
    config: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let adapter =
            create_app_with_spire(lift_arg::<Name>(name)?, lift_arg::<SpireConfig>(config)?)?;
        Ok(into_handle(adapter))
    })
}

// Object lifecycle

macro_rules! object_lifecycle {
    ($t:ty; $clone:ident, $free:ident) => {
        /// # Safety
        /// `ptr` must be a live handle of this object type.
        #[no_mangle]
        pub unsafe extern "C" fn $clone(ptr: *const c_void, status: &mut CallStatus) -> *const c_void {
            rust_call(status, || {
                if ptr.is_null() {
                    return Err(SlimError::InvalidArgument("null handle".to_string()));
                }
                Ok(clone_handle::<$t>(ptr))
            })
        }

        /// # Safety
        /// `ptr` must be a live handle of this object type; it is invalid
        /// afterwards.
        #[no_mangle]
        pub unsafe extern "C" fn $free(ptr: *const c_void, status: &mut CallStatus) {
            rust_call(status, || {
                if !ptr.is_null() {
                    free_handle::<$t>(ptr);
                }
                Ok(())
            })
        }
    };
}

object_lifecycle!(BindingsAdapter; slim_bindings_clone_bindingsadapter, slim_bindings_free_bindingsadapter);
object_lifecycle!(BindingsSessionContext;
    slim_bindings_clone_bindingssessioncontext, slim_bindings_free_bindingssessioncontext);
object_lifecycle!(FfiCompletionHandle;
    slim_bindings_clone_completionhandle, slim_bindings_free_completionhandle);

// BindingsAdapter

/// # Safety
/// `ptr` must be a live adapter handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_name(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsAdapter>(ptr)?.name()))
}

/// # Safety
/// `ptr` must be a live adapter handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_id(ptr: *const c_void, status: &mut CallStatus) -> u64 {
    rust_call(status, || Ok(object::<BindingsAdapter>(ptr)?.id()))
}

/// # Safety
/// `ptr` must be a live adapter handle; `config` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_connect(
    ptr: *const c_void,
    config: ForeignBytes,
    status: &mut CallStatus,
) -> u64 {
    rust_call(status, || {
        object::<BindingsAdapter>(ptr)?.connect(lift_arg::<ClientConfig>(config)?)
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; `config` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_connect_async(
    ptr: *const c_void,
    config: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr)
        .and_then(|a| Ok((a, lift_arg::<ClientConfig>(config)?)));
    spawn_with(args, |(adapter, config)| async move {
        adapter.connect_async(config).await
    })
}

/// # Safety
/// `ptr` must be a live adapter handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_disconnect(
    ptr: *const c_void,
    conn_id: u64,
    status: &mut CallStatus,
) {
    rust_call(status, || object::<BindingsAdapter>(ptr)?.disconnect(conn_id))
}

/// Returns the bound endpoint, encoded as a string.
///
/// # Safety
/// `ptr` must be a live adapter handle; `config` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_run_server(
    ptr: *const c_void,
    config: ForeignBytes,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || {
        let endpoint =
            object::<BindingsAdapter>(ptr)?.run_server(lift_arg::<ServerConfig>(config)?)?;
        lower_ret(endpoint)
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; `config` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_run_server_async(
    ptr: *const c_void,
    config: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr)
        .and_then(|a| Ok((a, lift_arg::<ServerConfig>(config)?)));
    spawn_with(args, |(adapter, config)| async move {
        let endpoint = adapter.run_server_async(config).await?;
        codec::lower(&endpoint)
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; `endpoint` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_stop_server(
    ptr: *const c_void,
    endpoint: ForeignBytes,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        object::<BindingsAdapter>(ptr)?.stop_server(&lift_arg::<String>(endpoint)?)
    })
}

/// `connection` is an encoded optional connection id.
///
/// # Safety
/// `ptr` must be a live adapter handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_subscribe(
    ptr: *const c_void,
    name: ForeignBytes,
    connection: ForeignBytes,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        object::<BindingsAdapter>(ptr)?
            .subscribe(lift_arg::<Name>(name)?, lift_arg::<Option<u64>>(connection)?)
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_subscribe_async(
    ptr: *const c_void,
    name: ForeignBytes,
    connection: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr).and_then(|a| {
        Ok((a, lift_arg::<Name>(name)?, lift_arg::<Option<u64>>(connection)?))
    });
    spawn_with(args, |(adapter, name, connection)| async move {
        adapter.subscribe_async(name, connection).await
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_unsubscribe(
    ptr: *const c_void,
    name: ForeignBytes,
    connection: ForeignBytes,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        object::<BindingsAdapter>(ptr)?
            .unsubscribe(lift_arg::<Name>(name)?, lift_arg::<Option<u64>>(connection)?)
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_unsubscribe_async(
    ptr: *const c_void,
    name: ForeignBytes,
    connection: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr).and_then(|a| {
        Ok((a, lift_arg::<Name>(name)?, lift_arg::<Option<u64>>(connection)?))
    });
    spawn_with(args, |(adapter, name, connection)| async move {
        adapter.unsubscribe_async(name, connection).await
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; `name` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_set_route(
    ptr: *const c_void,
    name: ForeignBytes,
    conn_id: u64,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        object::<BindingsAdapter>(ptr)?.set_route(&lift_arg::<Name>(name)?, conn_id)
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; `name` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_remove_route(
    ptr: *const c_void,
    name: ForeignBytes,
    conn_id: u64,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        object::<BindingsAdapter>(ptr)?.remove_route(&lift_arg::<Name>(name)?, conn_id)
    })
}

/// Returns a session context handle.
///
/// # Safety
/// `ptr` must be a live adapter handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_create_session(
    ptr: *const c_void,
    config: ForeignBytes,
    destination: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let session = object::<BindingsAdapter>(ptr)?.create_session(
            lift_arg::<SessionConfig>(config)?,
            lift_arg::<Name>(destination)?,
        )?;
        Ok(into_handle(session))
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_create_session_async(
    ptr: *const c_void,
    config: ForeignBytes,
    destination: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr).and_then(|a| {
        Ok((
            a,
            lift_arg::<SessionConfig>(config)?,
            lift_arg::<Name>(destination)?,
        ))
    });
    spawn_with(args, |(adapter, config, destination)| async move {
        let session = adapter.create_session_async(config, destination).await?;
        Ok(into_handle(session) as usize)
    })
}

/// `timeout` is an encoded optional duration; absent waits indefinitely.
///
/// # Safety
/// `ptr` must be a live adapter handle; `timeout` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_listen_for_session(
    ptr: *const c_void,
    timeout: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let session = object::<BindingsAdapter>(ptr)?
            .listen_for_session(lift_arg::<Option<Duration>>(timeout)?)?;
        Ok(into_handle(session))
    })
}

/// # Safety
/// `ptr` must be a live adapter handle; `timeout` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_listen_for_session_async(
    ptr: *const c_void,
    timeout: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr)
        .and_then(|a| Ok((a, lift_arg::<Option<Duration>>(timeout)?)));
    spawn_with(args, |(adapter, timeout)| async move {
        let session = adapter.listen_for_session_async(timeout).await?;
        Ok(into_handle(session) as usize)
    })
}

/// # Safety
/// `ptr` and `session` must be live handles of their types.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_delete_session(
    ptr: *const c_void,
    session: *const c_void,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        let adapter = object::<BindingsAdapter>(ptr)?;
        let session = object::<BindingsSessionContext>(session)?;
        adapter.delete_session(session.as_ref())
    })
}

/// # Safety
/// `ptr` and `session` must be live handles of their types.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_adapter_delete_session_async(
    ptr: *const c_void,
    session: *const c_void,
) -> *const c_void {
    let args = object::<BindingsAdapter>(ptr)
        .and_then(|a| Ok((a, object::<BindingsSessionContext>(session)?)));
    spawn_with(args, |(adapter, session)| async move {
        adapter.delete_session_async(&session).await
    })
}

// BindingsSessionContext

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_id(ptr: *const c_void, status: &mut CallStatus) -> u32 {
    rust_call(status, || Ok(object::<BindingsSessionContext>(ptr)?.session_id()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_type(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsSessionContext>(ptr)?.session_type()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_state(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsSessionContext>(ptr)?.state()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_source(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsSessionContext>(ptr)?.source()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_destination(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsSessionContext>(ptr)?.destination()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_is_initiator(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> bool {
    rust_call(status, || Ok(object::<BindingsSessionContext>(ptr)?.is_initiator()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_metadata(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsSessionContext>(ptr)?.metadata()))
}

/// # Safety
/// `ptr` must be a live session handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_participants(
    ptr: *const c_void,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || lower_ret(object::<BindingsSessionContext>(ptr)?.participants()))
}

/// `payload` is encoded bytes, `payload_type` an encoded optional string and
/// `metadata` an encoded optional string map.
///
/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish(
    ptr: *const c_void,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        let (payload, payload_type, metadata) = lift_payload(payload, payload_type, metadata)?;
        object::<BindingsSessionContext>(ptr)?.publish(payload, payload_type, metadata)
    })
}

/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_async(
    ptr: *const c_void,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr)
        .and_then(|s| Ok((s, lift_payload(payload, payload_type, metadata)?)));
    spawn_with(args, |(session, (payload, payload_type, metadata))| async move {
        session.publish_async(payload, payload_type, metadata).await
    })
}

/// Returns a completion handle.
///
/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_with_completion(
    ptr: *const c_void,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let (payload, payload_type, metadata) = lift_payload(payload, payload_type, metadata)?;
        let handle = object::<BindingsSessionContext>(ptr)?
            .publish_with_completion(payload, payload_type, metadata)?;
        Ok(into_handle(handle))
    })
}

/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_with_completion_async(
    ptr: *const c_void,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr)
        .and_then(|s| Ok((s, lift_payload(payload, payload_type, metadata)?)));
    spawn_with(args, |(session, (payload, payload_type, metadata))| async move {
        let handle = session
            .publish_with_completion_async(payload, payload_type, metadata)
            .await?;
        Ok(into_handle(handle) as usize)
    })
}

/// `context` is an encoded [`MessageContext`] taken from a received message.
///
/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_to(
    ptr: *const c_void,
    context: ForeignBytes,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        let context = lift_arg::<MessageContext>(context)?;
        let (payload, payload_type, metadata) = lift_payload(payload, payload_type, metadata)?;
        object::<BindingsSessionContext>(ptr)?.publish_to(context, payload, payload_type, metadata)
    })
}

/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_to_async(
    ptr: *const c_void,
    context: ForeignBytes,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr).and_then(|s| {
        Ok((
            s,
            lift_arg::<MessageContext>(context)?,
            lift_payload(payload, payload_type, metadata)?,
        ))
    });
    spawn_with(
        args,
        |(session, context, (payload, payload_type, metadata))| async move {
            session
                .publish_to_async(context, payload, payload_type, metadata)
                .await
        },
    )
}

/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_to_with_completion(
    ptr: *const c_void,
    context: ForeignBytes,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let context = lift_arg::<MessageContext>(context)?;
        let (payload, payload_type, metadata) = lift_payload(payload, payload_type, metadata)?;
        let handle = object::<BindingsSessionContext>(ptr)?
            .publish_to_with_completion(context, payload, payload_type, metadata)?;
        Ok(into_handle(handle))
    })
}

/// # Safety
/// `ptr` must be a live session handle; byte arguments must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_publish_to_with_completion_async(
    ptr: *const c_void,
    context: ForeignBytes,
    payload: ForeignBytes,
    payload_type: ForeignBytes,
    metadata: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr).and_then(|s| {
        Ok((
            s,
            lift_arg::<MessageContext>(context)?,
            lift_payload(payload, payload_type, metadata)?,
        ))
    });
    spawn_with(
        args,
        |(session, context, (payload, payload_type, metadata))| async move {
            let handle = session
                .publish_to_with_completion_async(context, payload, payload_type, metadata)
                .await?;
            Ok(into_handle(handle) as usize)
        },
    )
}

/// # Safety
/// `ptr` must be a live session handle; `participant` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_invite(
    ptr: *const c_void,
    participant: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let handle =
            object::<BindingsSessionContext>(ptr)?.invite(lift_arg::<Name>(participant)?)?;
        Ok(into_handle(handle))
    })
}

/// # Safety
/// `ptr` must be a live session handle; `participant` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_invite_async(
    ptr: *const c_void,
    participant: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr)
        .and_then(|s| Ok((s, lift_arg::<Name>(participant)?)));
    spawn_with(args, |(session, participant)| async move {
        let handle = session.invite_async(participant).await?;
        Ok(into_handle(handle) as usize)
    })
}

/// # Safety
/// `ptr` must be a live session handle; `participant` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_remove(
    ptr: *const c_void,
    participant: ForeignBytes,
    status: &mut CallStatus,
) -> *const c_void {
    rust_call(status, || {
        let handle =
            object::<BindingsSessionContext>(ptr)?.remove(lift_arg::<Name>(participant)?)?;
        Ok(into_handle(handle))
    })
}

/// # Safety
/// `ptr` must be a live session handle; `participant` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_remove_async(
    ptr: *const c_void,
    participant: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr)
        .and_then(|s| Ok((s, lift_arg::<Name>(participant)?)));
    spawn_with(args, |(session, participant)| async move {
        let handle = session.remove_async(participant).await?;
        Ok(into_handle(handle) as usize)
    })
}

/// Returns an encoded received message.
///
/// # Safety
/// `ptr` must be a live session handle; `timeout` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_get_message(
    ptr: *const c_void,
    timeout: ForeignBytes,
    status: &mut CallStatus,
) -> SlimBuffer {
    rust_call(status, || {
        let message = object::<BindingsSessionContext>(ptr)?
            .get_message(lift_arg::<Option<Duration>>(timeout)?)?;
        lower_ret(message)
    })
}

/// # Safety
/// `ptr` must be a live session handle; `timeout` must be readable.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_session_get_message_async(
    ptr: *const c_void,
    timeout: ForeignBytes,
) -> *const c_void {
    let args = object::<BindingsSessionContext>(ptr)
        .and_then(|s| Ok((s, lift_arg::<Option<Duration>>(timeout)?)));
    spawn_with(args, |(session, timeout)| async move {
        let message = session.get_message_async(timeout).await?;
        codec::lower(&message)
    })
}

// CompletionHandle

/// # Safety
/// `ptr` must be a live completion handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_completionhandle_wait(
    ptr: *const c_void,
    status: &mut CallStatus,
) {
    rust_call(status, || object::<FfiCompletionHandle>(ptr)?.wait())
}

/// # Safety
/// `ptr` must be a live completion handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_completionhandle_wait_async(
    ptr: *const c_void,
) -> *const c_void {
    spawn_with(object::<FfiCompletionHandle>(ptr), |handle| async move {
        handle.wait_async().await
    })
}

/// # Safety
/// `ptr` must be a live completion handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_completionhandle_wait_for(
    ptr: *const c_void,
    timeout_ms: i64,
    status: &mut CallStatus,
) {
    rust_call(status, || {
        object::<FfiCompletionHandle>(ptr)?.wait_for(duration_from_millis(timeout_ms)?)
    })
}

/// # Safety
/// `ptr` must be a live completion handle.
#[no_mangle]
pub unsafe extern "C" fn slim_bindings_completionhandle_wait_for_async(
    ptr: *const c_void,
    timeout_ms: i64,
) -> *const c_void {
    let args = object::<FfiCompletionHandle>(ptr)
        .and_then(|h| Ok((h, duration_from_millis(timeout_ms)?)));
    spawn_with(args, |(handle, timeout)| async move {
        handle.wait_for_async(timeout).await
    })
}
