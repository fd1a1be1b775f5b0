//! Build-compatibility contract between the native library and its foreign
//! adapter.
//!
//! The library reports a contract version and, for every API symbol, a 16-bit
//! checksum of the symbol's canonical signature. An adapter built against a
//! different revision of the API sees a different version or checksum and
//! refuses to start.

use std::sync::Once;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

/// Version of the exported API surface.
pub const CONTRACT_VERSION: u32 = 26;

/// First two bytes, big-endian, of SHA-256 over `signature`.
pub fn signature_checksum(signature: &str) -> u16 {
    let digest = Sha256::digest(signature.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// Reports [`CONTRACT_VERSION`].
#[no_mangle]
pub extern "C" fn slim_bindings_contract_version() -> u32 {
    CONTRACT_VERSION
}

macro_rules! api_contract {
    ($($symbol:ident => $checksum:ident: $signature:literal;)*) => {
        /// `(symbol, canonical signature)` for every checksummed entry point.
        pub static SIGNATURES: &[(&str, &str)] = &[$((stringify!($symbol), $signature)),*];

        $(
            /// Checksum of one exported signature.
            #[no_mangle]
            pub extern "C" fn $checksum() -> u16 {
                signature_checksum($signature)
            }
        )*

        fn linked_checksum(symbol: &str) -> Option<u16> {
            match symbol {
                $(stringify!($symbol) => Some($checksum()),)*
                _ => None,
            }
        }
    };
}

api_contract! {
    slim_bindings_buffer_alloc => slim_bindings_checksum_buffer_alloc: "slim_bindings_buffer_alloc(u64,status)->buffer";
    slim_bindings_buffer_from_bytes => slim_bindings_checksum_buffer_from_bytes: "slim_bindings_buffer_from_bytes(bytes,status)->buffer";
    slim_bindings_buffer_free => slim_bindings_checksum_buffer_free: "slim_bindings_buffer_free(SlimBuffer,status)->void";
    slim_bindings_initialize_crypto_provider => slim_bindings_checksum_initialize_crypto_provider: "slim_bindings_initialize_crypto_provider(status)->void";
    slim_bindings_initialize_tracing => slim_bindings_checksum_initialize_tracing: "slim_bindings_initialize_tracing(String,status)->void";
    slim_bindings_create_app => slim_bindings_checksum_create_app: "slim_bindings_create_app(Name,AuthConfig,status)->handle";
    slim_bindings_create_app_with_secret => slim_bindings_checksum_create_app_with_secret: "slim_bindings_create_app_with_secret(Name,String,status)->handle";
    slim_bindings_create_app_with_static_token => slim_bindings_checksum_create_app_with_static_token: "slim_bindings_create_app_with_static_token(Name,PathBuf,status)->handle";
    slim_bindings_create_app_with_jwt => slim_bindings_checksum_create_app_with_jwt: "slim_bindings_create_app_with_jwt(Name,JwtConfig,status)->handle";
    slim_bindings_create_app_with_spire => slim_bindings_checksum_create_app_with_spire: "slim_bindings_create_app_with_spire(Name,SpireConfig,status)->handle";
    slim_bindings_adapter_name => slim_bindings_checksum_adapter_name: "slim_bindings_adapter_name(handle,status)->Name";
    slim_bindings_adapter_id => slim_bindings_checksum_adapter_id: "slim_bindings_adapter_id(handle,status)->u64";
    slim_bindings_adapter_connect => slim_bindings_checksum_adapter_connect: "slim_bindings_adapter_connect(handle,ClientConfig,status)->u64";
    slim_bindings_adapter_connect_async => slim_bindings_checksum_adapter_connect_async: "slim_bindings_adapter_connect_async(handle,ClientConfig)->future<u64>";
    slim_bindings_adapter_disconnect => slim_bindings_checksum_adapter_disconnect: "slim_bindings_adapter_disconnect(handle,u64,status)->void";
    slim_bindings_adapter_run_server => slim_bindings_checksum_adapter_run_server: "slim_bindings_adapter_run_server(handle,ServerConfig,status)->String";
    slim_bindings_adapter_run_server_async => slim_bindings_checksum_adapter_run_server_async: "slim_bindings_adapter_run_server_async(handle,ServerConfig)->future<buffer>";
    slim_bindings_adapter_stop_server => slim_bindings_checksum_adapter_stop_server: "slim_bindings_adapter_stop_server(handle,String,status)->void";
    slim_bindings_adapter_subscribe => slim_bindings_checksum_adapter_subscribe: "slim_bindings_adapter_subscribe(handle,Name,Option<u64>,status)->void";
    slim_bindings_adapter_subscribe_async => slim_bindings_checksum_adapter_subscribe_async: "slim_bindings_adapter_subscribe_async(handle,Name,Option<u64>)->future<void>";
    slim_bindings_adapter_unsubscribe => slim_bindings_checksum_adapter_unsubscribe: "slim_bindings_adapter_unsubscribe(handle,Name,Option<u64>,status)->void";
    slim_bindings_adapter_unsubscribe_async => slim_bindings_checksum_adapter_unsubscribe_async: "slim_bindings_adapter_unsubscribe_async(handle,Name,Option<u64>)->future<void>";
    slim_bindings_adapter_set_route => slim_bindings_checksum_adapter_set_route: "slim_bindings_adapter_set_route(handle,Name,u64,status)->void";
    slim_bindings_adapter_remove_route => slim_bindings_checksum_adapter_remove_route: "slim_bindings_adapter_remove_route(handle,Name,u64,status)->void";
    slim_bindings_adapter_create_session => slim_bindings_checksum_adapter_create_session: "slim_bindings_adapter_create_session(handle,SessionConfig,Name,status)->handle";
    slim_bindings_adapter_create_session_async => slim_bindings_checksum_adapter_create_session_async: "slim_bindings_adapter_create_session_async(handle,SessionConfig,Name)->future<pointer>";
    slim_bindings_adapter_listen_for_session => slim_bindings_checksum_adapter_listen_for_session: "slim_bindings_adapter_listen_for_session(handle,Option<Duration>,status)->handle";
    slim_bindings_adapter_listen_for_session_async => slim_bindings_checksum_adapter_listen_for_session_async: "slim_bindings_adapter_listen_for_session_async(handle,Option<Duration>)->future<pointer>";
    slim_bindings_adapter_delete_session => slim_bindings_checksum_adapter_delete_session: "slim_bindings_adapter_delete_session(handle,handle,status)->void";
    slim_bindings_adapter_delete_session_async => slim_bindings_checksum_adapter_delete_session_async: "slim_bindings_adapter_delete_session_async(handle,handle)->future<void>";
    slim_bindings_session_id => slim_bindings_checksum_session_id: "slim_bindings_session_id(handle,status)->u32";
    slim_bindings_session_type => slim_bindings_checksum_session_type: "slim_bindings_session_type(handle,status)->SessionType";
    slim_bindings_session_state => slim_bindings_checksum_session_state: "slim_bindings_session_state(handle,status)->SessionState";
    slim_bindings_session_source => slim_bindings_checksum_session_source: "slim_bindings_session_source(handle,status)->Name";
    slim_bindings_session_destination => slim_bindings_checksum_session_destination: "slim_bindings_session_destination(handle,status)->Name";
    slim_bindings_session_is_initiator => slim_bindings_checksum_session_is_initiator: "slim_bindings_session_is_initiator(handle,status)->bool";
    slim_bindings_session_metadata => slim_bindings_checksum_session_metadata: "slim_bindings_session_metadata(handle,status)->HashMap<String,String>";
    slim_bindings_session_participants => slim_bindings_checksum_session_participants: "slim_bindings_session_participants(handle,status)->Vec<Name>";
    slim_bindings_session_publish => slim_bindings_checksum_session_publish: "slim_bindings_session_publish(handle,Vec<u8>,Option<String>,Option<HashMap<String,String>>,status)->void";
    slim_bindings_session_publish_async => slim_bindings_checksum_session_publish_async: "slim_bindings_session_publish_async(handle,Vec<u8>,Option<String>,Option<HashMap<String,String>>)->future<void>";
    slim_bindings_session_publish_with_completion => slim_bindings_checksum_session_publish_with_completion: "slim_bindings_session_publish_with_completion(handle,Vec<u8>,Option<String>,Option<HashMap<String,String>>,status)->handle";
    slim_bindings_session_publish_with_completion_async => slim_bindings_checksum_session_publish_with_completion_async: "slim_bindings_session_publish_with_completion_async(handle,Vec<u8>,Option<String>,Option<HashMap<String,String>>)->future<pointer>";
    slim_bindings_session_publish_to => slim_bindings_checksum_session_publish_to: "slim_bindings_session_publish_to(handle,MessageContext,Vec<u8>,Option<String>,Option<HashMap<String,String>>,status)->void";
    slim_bindings_session_publish_to_async => slim_bindings_checksum_session_publish_to_async: "slim_bindings_session_publish_to_async(handle,MessageContext,Vec<u8>,Option<String>,Option<HashMap<String,String>>)->future<void>";
    slim_bindings_session_publish_to_with_completion => slim_bindings_checksum_session_publish_to_with_completion: "slim_bindings_session_publish_to_with_completion(handle,MessageContext,Vec<u8>,Option<String>,Option<HashMap<String,String>>,status)->handle";
    slim_bindings_session_publish_to_with_completion_async => slim_bindings_checksum_session_publish_to_with_completion_async: "slim_bindings_session_publish_to_with_completion_async(handle,MessageContext,Vec<u8>,Option<String>,Option<HashMap<String,String>>)->future<pointer>";
    slim_bindings_session_invite => slim_bindings_checksum_session_invite: "slim_bindings_session_invite(handle,Name,status)->handle";
    slim_bindings_session_invite_async => slim_bindings_checksum_session_invite_async: "slim_bindings_session_invite_async(handle,Name)->future<pointer>";
    slim_bindings_session_remove => slim_bindings_checksum_session_remove: "slim_bindings_session_remove(handle,Name,status)->handle";
    slim_bindings_session_remove_async => slim_bindings_checksum_session_remove_async: "slim_bindings_session_remove_async(handle,Name)->future<pointer>";
    slim_bindings_session_get_message => slim_bindings_checksum_session_get_message: "slim_bindings_session_get_message(handle,Option<Duration>,status)->ReceivedMessage";
    slim_bindings_session_get_message_async => slim_bindings_checksum_session_get_message_async: "slim_bindings_session_get_message_async(handle,Option<Duration>)->future<buffer>";
    slim_bindings_completionhandle_wait => slim_bindings_checksum_completionhandle_wait: "slim_bindings_completionhandle_wait(handle,status)->void";
    slim_bindings_completionhandle_wait_async => slim_bindings_checksum_completionhandle_wait_async: "slim_bindings_completionhandle_wait_async(handle)->future<void>";
    slim_bindings_completionhandle_wait_for => slim_bindings_checksum_completionhandle_wait_for: "slim_bindings_completionhandle_wait_for(handle,i64,status)->void";
    slim_bindings_completionhandle_wait_for_async => slim_bindings_checksum_completionhandle_wait_for_async: "slim_bindings_completionhandle_wait_for_async(handle,i64)->future<void>";
}

/// What the native side reports about itself.
pub trait NativeContract {
    /// Reported contract version.
    fn contract_version(&self) -> u32;
    /// `None` when the native side does not export `symbol`.
    fn checksum(&self, symbol: &str) -> Option<u16>;
}

/// The contract of the library this crate is linked into.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedContract;

impl NativeContract for LinkedContract {
    fn contract_version(&self) -> u32 {
        slim_bindings_contract_version()
    }

    fn checksum(&self, symbol: &str) -> Option<u16> {
        linked_checksum(symbol)
    }
}

/// Why the adapter refuses a native library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// Different contract versions.
    #[error("contract version mismatch: adapter expects {expected}, native library reports {found}")]
    VersionMismatch {
        /// Version this adapter was generated against.
        expected: u32,
        /// Version reported by the library.
        found: u32,
    },

    /// A signature changed.
    #[error("checksum mismatch for {symbol}: adapter expects {expected:#06x}, native library reports {found:#06x}")]
    ChecksumMismatch {
        /// Exported symbol.
        symbol: String,
        /// Checksum this adapter expects.
        expected: u16,
        /// Checksum reported by the library.
        found: u16,
    },

    /// An expected symbol is not exported.
    #[error("checksum mismatch for {symbol}: symbol missing from native library")]
    MissingSymbol {
        /// Exported symbol.
        symbol: String,
    },
}

/// Expected contract on the adapter side.
#[derive(Debug, Clone)]
pub struct ContractGate {
    version: u32,
    checksums: Vec<(String, u16)>,
}

impl ContractGate {
    /// Gate expecting `version` and the given symbol checksums.
    pub fn new(version: u32, checksums: Vec<(String, u16)>) -> Self {
        Self { version, checksums }
    }

    /// The contract this build of the adapter was generated against.
    pub fn expected() -> Self {
        Self::new(
            CONTRACT_VERSION,
            SIGNATURES
                .iter()
                .map(|(symbol, signature)| (symbol.to_string(), signature_checksum(signature)))
                .collect(),
        )
    }

    /// Expected contract version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Checks the version, then every checksum.
    pub fn verify(&self, native: &dyn NativeContract) -> Result<(), ContractError> {
        let found = native.contract_version();
        if found != self.version {
            return Err(ContractError::VersionMismatch {
                expected: self.version,
                found,
            });
        }
        for (symbol, expected) in &self.checksums {
            match native.checksum(symbol) {
                Some(found) if found == *expected => {}
                Some(found) => {
                    return Err(ContractError::ChecksumMismatch {
                        symbol: symbol.clone(),
                        expected: *expected,
                        found,
                    })
                }
                None => {
                    return Err(ContractError::MissingSymbol {
                        symbol: symbol.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Verifies `native` and aborts the process on any mismatch. Runs before
    /// any other API call.
    pub fn ensure(&self, native: &dyn NativeContract) {
        if let Err(e) = self.verify(native) {
            error!(error = %e, "native library does not match this adapter");
            eprintln!("slim-bindings: {}", e);
            std::process::abort();
        }
    }
}

static LINKED_CHECK: Once = Once::new();

/// Checks the linked native symbols against this adapter once per process,
/// aborting on a mismatch. Every app factory runs it first.
pub fn ensure_linked_contract() {
    LINKED_CHECK.call_once(|| {
        ContractGate::expected().ensure(&LinkedContract);
        debug!(version = CONTRACT_VERSION, "native contract verified");
    });
}

/// True once [`ensure_linked_contract`] has passed in this process.
pub fn linked_contract_verified() -> bool {
    LINKED_CHECK.is_completed()
}
