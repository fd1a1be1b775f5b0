#![warn(missing_docs)]

//! SLIM session layer.
//!
//! An [`App`] is a named endpoint on top of a message processor. Apps open
//! point-to-point or group [`Session`]s, publish with optional delivery
//! confirmation and receive through per-session queues. Every message carries
//! an identity token checked by the receiving app, and payloads may be sealed
//! end to end.

pub mod app;
pub mod auth;
pub mod completion;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod session;

pub use app::App;
pub use auth::{
    AuthConfig, Authenticator, JwtAlgorithm, JwtConfig, SpireConfig, TokenProvider,
    TokenVerifier,
};
pub use completion::{completion, CompletionHandle, CompletionSender};
pub use config::{
    SessionConfig, SessionState, SessionType, DEFAULT_INTERVAL_MS, DEFAULT_MAX_RETRIES,
    RECEIVE_QUEUE_CAPACITY,
};
pub use context::{MessageContext, ReceivedMessage, DEFAULT_PAYLOAD_TYPE};
pub use error::{Result, SlimError};
pub use session::Session;

pub use slim_datapath::Name;
pub use slim_transport::{ClientConfig, ConnectionId, ServerConfig, TlsConfig};
