//! Objects exported across the boundary: the app adapter, session contexts
//! and completion handles.
//!
//! Every suspending operation comes in two forms. The `_async` form is the
//! native future; the plain form runs that future on the shared runtime and
//! parks the calling thread until it resolves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use slim_session::{
    App, AuthConfig, ClientConfig, CompletionHandle, ConnectionId, JwtConfig, MessageContext,
    Name, ReceivedMessage, Result, ServerConfig, Session, SessionConfig, SessionState,
    SessionType, SpireConfig,
};
use tracing::info;

use crate::contract::ensure_linked_contract;
use crate::init::initialize_crypto_provider;
use crate::runtime::{block_on, runtime};

/// One local app, as seen by the foreign side.
#[derive(Clone)]
pub struct BindingsAdapter {
    app: App,
}

impl std::fmt::Debug for BindingsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingsAdapter")
            .field("name", self.app.name())
            .finish()
    }
}

impl BindingsAdapter {
    /// Wraps an app created by the session layer.
    pub fn new(app: App) -> Self {
        Self { app }
    }

    /// The wrapped app.
    pub fn app(&self) -> &App {
        &self.app
    }

    /// Fully qualified app name.
    pub fn name(&self) -> Name {
        self.app.name().clone()
    }

    /// Numeric id component of the app name.
    pub fn id(&self) -> u64 {
        self.app.id()
    }

    /// Connects to a node and announces local subscriptions on it.
    pub async fn connect_async(&self, config: ClientConfig) -> Result<ConnectionId> {
        self.app.connect(&config).await
    }

    /// Blocking form of [`BindingsAdapter::connect_async`].
    pub fn connect(&self, config: ClientConfig) -> Result<ConnectionId> {
        let this = self.clone();
        block_on(async move { this.connect_async(config).await })
    }

    /// Closes a connection.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        self.app.disconnect(conn_id)
    }

    /// Starts a server and returns the bound endpoint.
    pub async fn run_server_async(&self, config: ServerConfig) -> Result<String> {
        self.app.run_server(&config).await
    }

    /// Starts a server and returns the bound endpoint.
    pub fn run_server(&self, config: ServerConfig) -> Result<String> {
        let this = self.clone();
        block_on(async move { this.run_server_async(config).await })
    }

    /// Stops the server bound to `endpoint`.
    pub fn stop_server(&self, endpoint: &str) -> Result<()> {
        self.app.stop_server(endpoint)
    }

    /// Subscribes `name` and announces it upstream.
    pub async fn subscribe_async(
        &self,
        name: Name,
        connection: Option<ConnectionId>,
    ) -> Result<()> {
        self.app.subscribe(&name, connection).await
    }

    /// Blocking form of [`BindingsAdapter::subscribe_async`].
    pub fn subscribe(&self, name: Name, connection: Option<ConnectionId>) -> Result<()> {
        let this = self.clone();
        block_on(async move { this.subscribe_async(name, connection).await })
    }

    /// Withdraws a subscription.
    pub async fn unsubscribe_async(
        &self,
        name: Name,
        connection: Option<ConnectionId>,
    ) -> Result<()> {
        self.app.unsubscribe(&name, connection).await
    }

    /// Blocking form of [`BindingsAdapter::unsubscribe_async`].
    pub fn unsubscribe(&self, name: Name, connection: Option<ConnectionId>) -> Result<()> {
        let this = self.clone();
        block_on(async move { this.unsubscribe_async(name, connection).await })
    }

    /// Pins traffic for `name` to one connection.
    pub fn set_route(&self, name: &Name, conn_id: ConnectionId) -> Result<()> {
        self.app.set_route(name, conn_id)
    }

    /// Removes a pinned route.
    pub fn remove_route(&self, name: &Name, conn_id: ConnectionId) -> Result<()> {
        self.app.remove_route(name, conn_id)
    }

    /// Returns once the peer acknowledged the handshake.
    pub async fn create_session_async(
        &self,
        config: SessionConfig,
        destination: Name,
    ) -> Result<BindingsSessionContext> {
        let session = self.app.create_session(config, destination).await?;
        Ok(BindingsSessionContext::new(session))
    }

    /// Blocking form of [`BindingsAdapter::create_session_async`].
    pub fn create_session(
        &self,
        config: SessionConfig,
        destination: Name,
    ) -> Result<BindingsSessionContext> {
        let this = self.clone();
        block_on(async move { this.create_session_async(config, destination).await })
    }

    /// Waits for a peer to open a session with this app.
    pub async fn listen_for_session_async(
        &self,
        timeout: Option<Duration>,
    ) -> Result<BindingsSessionContext> {
        let session = self.app.listen_for_session(timeout).await?;
        Ok(BindingsSessionContext::new(session))
    }

    /// Blocking form of [`BindingsAdapter::listen_for_session_async`].
    pub fn listen_for_session(&self, timeout: Option<Duration>) -> Result<BindingsSessionContext> {
        let this = self.clone();
        block_on(async move { this.listen_for_session_async(timeout).await })
    }

    /// Closes the session and removes it from the app.
    pub async fn delete_session_async(&self, session: &BindingsSessionContext) -> Result<()> {
        self.app.delete_session(&session.session).await
    }

    /// Blocking form of [`BindingsAdapter::delete_session_async`].
    pub fn delete_session(&self, session: &BindingsSessionContext) -> Result<()> {
        let this = self.clone();
        let session = session.clone();
        block_on(async move { this.delete_session_async(&session).await })
    }

    /// Stops the app and closes every session.
    pub fn shutdown(&self) {
        self.app.shutdown();
    }
}

/// A session handed to the foreign side.
#[derive(Debug, Clone)]
pub struct BindingsSessionContext {
    session: Session,
}

impl BindingsSessionContext {
    /// Wraps a session.
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// The wrapped session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Local session id.
    pub fn session_id(&self) -> u32 {
        self.session.id()
    }

    /// Point-to-point or group.
    pub fn session_type(&self) -> SessionType {
        self.session.session_type()
    }

    /// Name of the local app.
    pub fn source(&self) -> Name {
        self.session.source()
    }

    /// Peer name, or group name.
    pub fn destination(&self) -> Name {
        self.session.destination()
    }

    /// True on the side that created the session.
    pub fn is_initiator(&self) -> bool {
        self.session.is_initiator()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Metadata set by the creator.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.session.metadata()
    }

    /// Known participants.
    pub fn participants(&self) -> Vec<Name> {
        self.session.participants()
    }

    /// Fire-and-forget publish.
    pub async fn publish_async(
        &self,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.session.publish(payload, payload_type, metadata).await
    }

    /// Blocking form of [`BindingsSessionContext::publish_async`].
    pub fn publish(
        &self,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let this = self.clone();
        block_on(async move { this.publish_async(payload, payload_type, metadata).await })
    }

    /// Publish resolved by the peer's acknowledgement.
    pub async fn publish_with_completion_async(
        &self,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<FfiCompletionHandle> {
        self.session
            .publish_with_completion(payload, payload_type, metadata)
            .await
            .map(FfiCompletionHandle::new)
    }

    /// Blocking form of [`BindingsSessionContext::publish_with_completion_async`].
    pub fn publish_with_completion(
        &self,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<FfiCompletionHandle> {
        let this = self.clone();
        block_on(async move {
            this.publish_with_completion_async(payload, payload_type, metadata)
                .await
        })
    }

    /// Replies to the sender of a received message.
    pub async fn publish_to_async(
        &self,
        context: MessageContext,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.session
            .publish_to(&context, payload, payload_type, metadata)
            .await
    }

    /// Blocking form of [`BindingsSessionContext::publish_to_async`].
    pub fn publish_to(
        &self,
        context: MessageContext,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let this = self.clone();
        block_on(async move {
            this.publish_to_async(context, payload, payload_type, metadata)
                .await
        })
    }

    /// Reply resolved by the peer's acknowledgement.
    pub async fn publish_to_with_completion_async(
        &self,
        context: MessageContext,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<FfiCompletionHandle> {
        self.session
            .publish_to_with_completion(&context, payload, payload_type, metadata)
            .await
            .map(FfiCompletionHandle::new)
    }

    /// Blocking form of [`BindingsSessionContext::publish_to_with_completion_async`].
    pub fn publish_to_with_completion(
        &self,
        context: MessageContext,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<FfiCompletionHandle> {
        let this = self.clone();
        block_on(async move {
            this.publish_to_with_completion_async(context, payload, payload_type, metadata)
                .await
        })
    }

    /// Invites `participant` into a group session.
    pub async fn invite_async(&self, participant: Name) -> Result<FfiCompletionHandle> {
        self.session
            .invite(&participant)
            .await
            .map(FfiCompletionHandle::new)
    }

    /// Blocking form of [`BindingsSessionContext::invite_async`].
    pub fn invite(&self, participant: Name) -> Result<FfiCompletionHandle> {
        let this = self.clone();
        block_on(async move { this.invite_async(participant).await })
    }

    /// Removes `participant` from a group session.
    pub async fn remove_async(&self, participant: Name) -> Result<FfiCompletionHandle> {
        self.session
            .remove(&participant)
            .await
            .map(FfiCompletionHandle::new)
    }

    /// Blocking form of [`BindingsSessionContext::remove_async`].
    pub fn remove(&self, participant: Name) -> Result<FfiCompletionHandle> {
        let this = self.clone();
        block_on(async move { this.remove_async(participant).await })
    }

    /// Next message, or `Timeout` once `timeout` elapses.
    pub async fn get_message_async(&self, timeout: Option<Duration>) -> Result<ReceivedMessage> {
        self.session.get_message(timeout).await
    }

    /// Blocking form of [`BindingsSessionContext::get_message_async`].
    pub fn get_message(&self, timeout: Option<Duration>) -> Result<ReceivedMessage> {
        let this = self.clone();
        block_on(async move { this.get_message_async(timeout).await })
    }
}

/// Completion handle exported to the foreign side. Waiting consumes it.
#[derive(Debug, Clone)]
pub struct FfiCompletionHandle {
    inner: std::sync::Arc<CompletionHandle>,
}

impl FfiCompletionHandle {
    /// Wraps a session completion handle.
    pub fn new(handle: CompletionHandle) -> Self {
        Self {
            inner: std::sync::Arc::new(handle),
        }
    }

    /// Waits for the outcome.
    pub async fn wait_async(&self) -> Result<()> {
        self.inner.wait().await
    }

    /// Blocking form of [`FfiCompletionHandle::wait_async`].
    pub fn wait(&self) -> Result<()> {
        let this = self.clone();
        block_on(async move { this.wait_async().await })
    }

    /// Waits for the outcome, at most `timeout`.
    pub async fn wait_for_async(&self, timeout: Duration) -> Result<()> {
        self.inner.wait_for(timeout).await
    }

    /// Blocking form of [`FfiCompletionHandle::wait_for_async`].
    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        let this = self.clone();
        block_on(async move { this.wait_for_async(timeout).await })
    }
}

/// Builds an adapter for `name` authenticated by `auth`.
pub fn create_app(name: Name, auth: AuthConfig) -> Result<BindingsAdapter> {
    ensure_linked_contract();
    initialize_crypto_provider();
    // The app spawns its dispatch task on construction.
    let _guard = runtime().enter();
    let app = App::new(name, &auth)?;
    info!(name = %app.name(), id = app.id(), "bindings app created");
    Ok(BindingsAdapter::new(app))
}

/// App authenticated by a shared secret.
pub fn create_app_with_secret(name: Name, shared_secret: String) -> Result<BindingsAdapter> {
    create_app(name, AuthConfig::SharedSecret { secret: shared_secret })
}

/// App authenticated by a static token file.
pub fn create_app_with_static_token(name: Name, token_file: PathBuf) -> Result<BindingsAdapter> {
    create_app(name, AuthConfig::StaticToken { token_file })
}

/// App authenticated by self-issued JWTs.
pub fn create_app_with_jwt(name: Name, config: JwtConfig) -> Result<BindingsAdapter> {
    create_app(name, AuthConfig::Jwt(config))
}

/// App authenticated by SPIRE JWT-SVIDs.
pub fn create_app_with_spire(name: Name, config: SpireConfig) -> Result<BindingsAdapter> {
    create_app(name, AuthConfig::Spire(config))
}
