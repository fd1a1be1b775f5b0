#![warn(missing_docs)]

//! Foreign-function adapter for SLIM.
//!
//! Exposes apps, sessions and completion handles through a C ABI. Values are
//! exchanged as codec-encoded buffers, objects as reference-counted handles,
//! and every suspending operation has a blocking entry point and an `_async`
//! entry point returning a pollable future. A contract version plus one
//! signature checksum per symbol lets the foreign side detect mixed builds.

pub mod adapter;
pub mod buffer;
pub mod codec;
pub mod contract;
pub mod ffi;
pub mod future;
pub mod handle;
pub mod init;
pub mod install;
pub mod runtime;
pub mod status;

pub use adapter::{
    create_app, create_app_with_jwt, create_app_with_secret, create_app_with_spire,
    create_app_with_static_token, BindingsAdapter, BindingsSessionContext, FfiCompletionHandle,
};
pub use buffer::{ForeignBytes, SlimBuffer};
pub use contract::{
    ensure_linked_contract, linked_contract_verified, ContractError, ContractGate, LinkedContract,
    NativeContract, CONTRACT_VERSION,
};
pub use handle::HandleCell;
pub use init::{initialize_crypto_provider, initialize_tracing};
pub use install::{
    cache_dir, library_file_name, library_path, validate_archive_entry, InstallError,
};
pub use runtime::{block_on, runtime};
pub use status::{rust_call, CallStatus, CALL_ERROR, CALL_PANIC, CALL_SUCCESS};
