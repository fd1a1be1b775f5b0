//! Local endpoint: owns a message processor, the session table and the
//! inbound-session queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use slim_datapath::{Delivery, MessageBody, MessageProcessor, Name, UNICAST};
use slim_transport::{ClientConfig, ConnectionId, ServerConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthConfig, Authenticator};
use crate::config::{SessionConfig, SessionType};
use crate::error::{Result, SlimError};
use crate::protocol::{SessionEnvelope, SessionMessage};
use crate::session::{Inbound, Session, SessionInner, SessionParams, Shared};

#[derive(Default)]
struct SessionTable {
    by_id: HashMap<u32, Arc<SessionInner>>,
    /// `(initiator, initiator's session id)` to local id.
    by_wire: HashMap<(Name, u32), u32>,
}

struct AppInner {
    shared: Arc<Shared>,
    sessions: RwLock<SessionTable>,
    next_session_id: AtomicU32,
    inbound_tx: mpsc::UnboundedSender<Session>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Session>>,
    /// `Some(flag)` rejects peers whose encryption setting differs.
    mls_policy: Mutex<Option<bool>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AppInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
        for session in self.sessions.get_mut().by_id.values() {
            session.close_local();
        }
        self.shared.processor.shutdown();
    }
}

/// Table entry for a session still being established. Unless kept, the
/// entry is closed and removed when this goes out of scope, including when
/// the establishing future is dropped.
struct Registration<'a> {
    app: &'a AppInner,
    session: Arc<SessionInner>,
    keep: bool,
}

impl Registration<'_> {
    fn keep(mut self) -> Arc<SessionInner> {
        self.keep = true;
        Arc::clone(&self.session)
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.keep {
            debug!(session_id = self.session.id(), "session not established, removed");
            self.session.close_local();
            self.app.remove(&self.session);
        }
    }
}

/// A named local endpoint. Clones share the same endpoint.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.inner.shared.name)
            .finish()
    }
}

impl App {
    /// Creates an app authenticated as described by `auth`. A name without
    /// an id gets a random one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: Name, auth: &AuthConfig) -> Result<Self> {
        let name = if name.has_id() {
            name
        } else {
            name.with_id(rand::random())
        };
        let authenticator = Authenticator::from_config(&name.to_string(), auth)?;
        Self::with_authenticator(name, authenticator)
    }

    /// Builds an app around an already configured authenticator.
    pub fn with_authenticator(name: Name, auth: Authenticator) -> Result<Self> {
        let (processor, deliveries) = MessageProcessor::new();
        processor.subscribe(&name, None)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(AppInner {
            shared: Arc::new(Shared {
                name: name.clone(),
                processor,
                auth,
            }),
            sessions: RwLock::new(SessionTable::default()),
            next_session_id: AtomicU32::new(rand::random()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            mls_policy: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        });
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), deliveries));
        *inner.dispatch_task.lock() = Some(task);
        info!(name = %name, "app started");
        Ok(Self { inner })
    }

    /// Fully qualified name of this app, id included.
    pub fn name(&self) -> &Name {
        &self.inner.shared.name
    }

    /// Numeric id of the app name.
    pub fn id(&self) -> u64 {
        self.inner.shared.name.id().unwrap_or_default()
    }

    /// The datapath processor owned by this app.
    pub fn processor(&self) -> &MessageProcessor {
        &self.inner.shared.processor
    }

    /// Opens a connection and announces every local subscription on it.
    pub async fn connect(&self, config: &ClientConfig) -> Result<ConnectionId> {
        let shared = &self.inner.shared;
        let conn_id = shared
            .processor
            .connect(config)
            .await
            .map_err(SlimError::service)?;
        let token = shared.auth.token()?;
        let local: Vec<Name> = shared
            .processor
            .fabric()
            .subscriptions()
            .into_iter()
            .filter(|(_, conn)| conn.is_none())
            .map(|(name, _)| name)
            .collect();
        for name in &local {
            shared.announce_on(conn_id, name, true, &token).await;
        }
        info!(conn_id, endpoint = %config.endpoint, "app connected");
        Ok(conn_id)
    }

    /// Closes a client or accepted connection.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        self.inner.shared.processor.disconnect(conn_id)?;
        Ok(())
    }

    /// Starts a server and returns the bound endpoint.
    pub async fn run_server(&self, config: &ServerConfig) -> Result<String> {
        self.inner
            .shared
            .processor
            .run_server(config)
            .await
            .map_err(SlimError::service)
    }

    /// Stops the server bound to `endpoint`.
    pub fn stop_server(&self, endpoint: &str) -> Result<()> {
        self.inner
            .shared
            .processor
            .stop_server(endpoint)
            .map_err(SlimError::service)
    }

    /// Subscribes `name` locally and announces it on `connection`, or on
    /// every open connection when `None`.
    pub async fn subscribe(&self, name: &Name, connection: Option<ConnectionId>) -> Result<()> {
        let shared = &self.inner.shared;
        shared.processor.subscribe(name, None)?;
        match connection {
            Some(conn_id) => {
                let token = shared.auth.token()?;
                shared.announce_on(conn_id, name, true, &token).await;
            }
            None => shared.announce(name, true).await,
        }
        Ok(())
    }

    /// Inverse of [`App::subscribe`].
    pub async fn unsubscribe(&self, name: &Name, connection: Option<ConnectionId>) -> Result<()> {
        let shared = &self.inner.shared;
        shared.processor.unsubscribe(name, None)?;
        match connection {
            Some(conn_id) => {
                let token = shared.auth.token()?;
                shared.announce_on(conn_id, name, false, &token).await;
            }
            None => shared.announce(name, false).await,
        }
        Ok(())
    }

    /// Pins traffic for `name` to `conn_id` without announcing it.
    pub fn set_route(&self, name: &Name, conn_id: ConnectionId) -> Result<()> {
        self.inner.shared.processor.set_route(name, conn_id)?;
        Ok(())
    }

    /// Removes a route added by [`App::set_route`].
    pub fn remove_route(&self, name: &Name, conn_id: ConnectionId) -> Result<()> {
        self.inner.shared.processor.remove_route(name, conn_id)?;
        Ok(())
    }

    /// Requires peers to match `enabled`; `None` accepts either.
    pub fn set_mls_policy(&self, enabled: Option<bool>) {
        *self.inner.mls_policy.lock() = enabled;
    }

    /// Creates a session and waits until it is established. For a group
    /// session `destination` is the group name and this app moderates it.
    pub async fn create_session(&self, config: SessionConfig, destination: Name) -> Result<Session> {
        config.validate()?;
        let session_type = config.session_type;
        let id = self.inner.allocate_id();
        let session = SessionInner::new(
            SessionParams {
                id,
                initiator: self.inner.shared.name.clone(),
                wire_id: id,
                config,
                destination,
                is_initiator: true,
            },
            Arc::clone(&self.inner.shared),
        );
        self.inner.insert(&session);
        let registration = Registration {
            app: &self.inner,
            session,
            keep: false,
        };

        match session_type {
            SessionType::PointToPoint => registration.session.open().await?,
            SessionType::Group => registration.session.start_group().await?,
        }
        Ok(Session::from_inner(registration.keep()))
    }

    /// Next session opened by a peer. `None` waits indefinitely.
    pub async fn listen_for_session(&self, timeout: Option<Duration>) -> Result<Session> {
        let next = async {
            let mut rx = self.inner.inbound_rx.lock().await;
            rx.recv().await
        };
        let next = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, next)
                .await
                .map_err(|_| SlimError::Timeout)?,
            None => next.await,
        };
        next.ok_or_else(|| SlimError::ServiceError("app shut down".to_string()))
    }

    /// Tears the session down and forgets it. A second call fails.
    pub async fn delete_session(&self, session: &Session) -> Result<()> {
        let inner = session.inner();
        inner.mark_deleted()?;
        inner.terminate().await;
        self.inner.remove(inner);
        info!(session_id = inner.id(), "session deleted");
        Ok(())
    }

    /// Looks up a live session by local id.
    pub fn session(&self, id: u32) -> Option<Session> {
        self.inner
            .sessions
            .read()
            .by_id
            .get(&id)
            .cloned()
            .map(Session::from_inner)
    }

    /// Ids of all live sessions, sorted.
    pub fn session_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.sessions.read().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Closes every session, server and connection.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<SessionInner>> =
            self.inner.sessions.read().by_id.values().cloned().collect();
        for session in sessions {
            session.close_local();
        }
        self.inner.shared.processor.shutdown();
        info!(name = %self.inner.shared.name, "app shut down");
    }
}

impl AppInner {
    fn allocate_id(&self) -> u32 {
        let sessions = self.sessions.read();
        loop {
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !sessions.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&self, session: &Arc<SessionInner>) {
        let mut table = self.sessions.write();
        table.by_wire.insert(session.wire_key(), session.id());
        table.by_id.insert(session.id(), Arc::clone(session));
    }

    fn remove(&self, session: &SessionInner) {
        let mut table = self.sessions.write();
        table.by_id.remove(&session.id());
        table.by_wire.remove(&session.wire_key());
    }

    fn lookup(&self, initiator: &Name, session_id: u32) -> Option<Arc<SessionInner>> {
        let table = self.sessions.read();
        let id = table.by_wire.get(&(initiator.clone(), session_id))?;
        table.by_id.get(id).cloned()
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let Delivery {
            message,
            input_connection,
        } = delivery;
        let MessageBody::Session(bytes) = &message.body else {
            return;
        };
        let identity = match self.shared.auth.verify(&message.identity) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(source = %message.source, error = %e, "unauthenticated message dropped");
                return;
            }
        };
        let envelope = match SessionEnvelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(source = %message.source, error = %e, "undecodable session message dropped");
                return;
            }
        };
        let inbound = Inbound {
            source: message.source,
            destination: message.destination,
            input_connection,
            identity,
            envelope,
        };

        if let Some(session) = self.lookup(&inbound.envelope.initiator, inbound.envelope.session_id)
        {
            session.on_message(inbound).await;
            return;
        }
        match &inbound.envelope.message {
            SessionMessage::Open { .. } => self.accept_open(inbound).await,
            SessionMessage::Invite { .. } => self.accept_invite(inbound).await,
            SessionMessage::Close if inbound.envelope.correlation_id.is_some() => {
                self.reply(&inbound, SessionMessage::CloseAck).await
            }
            other => debug!(
                source = %inbound.source,
                session_id = inbound.envelope.session_id,
                kind = other.name(),
                "message for unknown session dropped"
            ),
        }
    }

    /// Answers a message that has no local session.
    async fn reply(&self, inbound: &Inbound, message: SessionMessage) {
        let envelope = SessionEnvelope {
            initiator: inbound.envelope.initiator.clone(),
            session_id: inbound.envelope.session_id,
            session_type: inbound.envelope.session_type,
            from_initiator: false,
            correlation_id: inbound.envelope.correlation_id,
            message,
        };
        if let Err(e) = self
            .shared
            .send(
                &inbound.source,
                UNICAST,
                Some(inbound.input_connection),
                &envelope,
            )
            .await
        {
            debug!(source = %inbound.source, error = %e, "reply not sent");
        }
    }

    fn mls_mismatch(&self, requested: bool) -> bool {
        matches!(*self.mls_policy.lock(), Some(required) if required != requested)
    }

    fn new_responder(&self, inbound: &Inbound, config: SessionConfig, destination: Name) -> Arc<SessionInner> {
        SessionInner::new(
            SessionParams {
                id: self.allocate_id(),
                initiator: inbound.envelope.initiator.clone(),
                wire_id: inbound.envelope.session_id,
                config,
                destination,
                is_initiator: false,
            },
            Arc::clone(&self.shared),
        )
    }

    async fn accept_open(&self, inbound: Inbound) {
        let SessionMessage::Open {
            mls,
            metadata,
            public_key,
        } = &inbound.envelope.message
        else {
            return;
        };
        if self.mls_mismatch(*mls) {
            warn!(source = %inbound.source, "session rejected: mls mismatch");
            self.reply(
                &inbound,
                SessionMessage::OpenReject {
                    reason: "mls mismatch".to_string(),
                },
            )
            .await;
            return;
        }

        let config = SessionConfig {
            session_type: SessionType::PointToPoint,
            mls_enabled: *mls,
            metadata: metadata.clone(),
            ..SessionConfig::default()
        };
        let session = self.new_responder(&inbound, config, inbound.source.clone());
        match session.accept_open(&inbound.source, inbound.input_connection, public_key.as_deref()) {
            Ok(answer) => {
                self.insert(&session);
                self.reply(&inbound, answer).await;
                info!(session_id = session.id(), peer = %inbound.source, "session accepted");
                let _ = self.inbound_tx.send(Session::from_inner(session));
            }
            Err(e) => {
                warn!(source = %inbound.source, error = %e, "session rejected");
                self.reply(
                    &inbound,
                    SessionMessage::OpenReject {
                        reason: e.message().unwrap_or("rejected").to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn accept_invite(&self, inbound: Inbound) {
        let SessionMessage::Invite {
            group,
            mls,
            metadata,
            public_key,
        } = &inbound.envelope.message
        else {
            return;
        };
        if self.mls_mismatch(*mls) {
            warn!(source = %inbound.source, group = %group, "invite rejected: mls mismatch");
            self.reply(
                &inbound,
                SessionMessage::InviteReject {
                    reason: "mls mismatch".to_string(),
                },
            )
            .await;
            return;
        }

        let config = SessionConfig {
            session_type: SessionType::Group,
            mls_enabled: *mls,
            metadata: metadata.clone(),
            ..SessionConfig::default()
        };
        let session = self.new_responder(&inbound, config, group.clone());
        match session
            .accept_invite(&inbound.source, inbound.input_connection, public_key.as_deref())
            .await
        {
            Ok(answer) => {
                self.insert(&session);
                self.reply(&inbound, answer).await;
                let _ = self.inbound_tx.send(Session::from_inner(session));
            }
            Err(e) => {
                warn!(source = %inbound.source, error = %e, "invite rejected");
                session.close_local();
                self.reply(
                    &inbound,
                    SessionMessage::InviteReject {
                        reason: e.message().unwrap_or("rejected").to_string(),
                    },
                )
                .await;
            }
        }
    }
}

async fn dispatch_loop(app: Weak<AppInner>, mut deliveries: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        let Some(app) = app.upgrade() else {
            break;
        };
        app.handle_delivery(delivery).await;
    }
    debug!("dispatch loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> AuthConfig {
        AuthConfig::SharedSecret {
            secret: "0123456789abcdef0123456789abcdef".to_string(),
        }
    }

    #[tokio::test]
    async fn test_random_id_assigned() {
        let app = App::new(Name::new(["org", "ns", "svc"], None).unwrap(), &secret()).unwrap();
        assert!(app.name().has_id());
        assert!(app
            .processor()
            .fabric()
            .is_subscribed(app.name(), None));
    }

    #[tokio::test]
    async fn test_listen_timeout() {
        let app = App::new(Name::new(["org", "ns", "svc"], Some(1)).unwrap(), &secret()).unwrap();
        let start = std::time::Instant::now();
        let err = app
            .listen_for_session(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err, SlimError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_create_session_rejects_zero_interval() {
        let app = App::new(Name::new(["org", "ns", "svc"], Some(1)).unwrap(), &secret()).unwrap();
        let config = SessionConfig::point_to_point().with_retries(1, 0);
        let err = app
            .create_session(config, Name::new(["org", "ns", "peer"], None).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SlimError::InvalidArgument(_)));
        assert!(app.session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_group_delete_twice() {
        let app = App::new(Name::new(["org", "ns", "svc"], Some(1)).unwrap(), &secret()).unwrap();
        let group = Name::new(["org", "ns", "room"], None).unwrap();
        let session = app
            .create_session(SessionConfig::group(), group)
            .await
            .unwrap();
        assert_eq!(app.session_ids(), vec![session.id()]);
        app.delete_session(&session).await.unwrap();
        assert!(app.session_ids().is_empty());
        assert_eq!(
            app.delete_session(&session).await,
            Err(SlimError::InvalidArgument("session already deleted".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_service_error() {
        let app = App::new(Name::new(["org", "ns", "svc"], Some(1)).unwrap(), &secret()).unwrap();
        let err = app
            .connect(&ClientConfig::insecure("127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SlimError::ServiceError(_)));
    }
}
