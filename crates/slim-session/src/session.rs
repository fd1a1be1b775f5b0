//! Session state machine.
//!
//! A session is identified on every participant by the initiator's name and
//! the id the initiator chose for it. Requests that need an answer carry a
//! correlation id and are retransmitted every `interval_ms` until the answer
//! arrives or the attempt budget is spent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use slim_datapath::{Message, MessageBody, MessageProcessor, Name, BROADCAST, UNICAST};
use slim_transport::ConnectionId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth::Authenticator;
use crate::completion::{completion, CompletionHandle};
use crate::config::{SessionConfig, SessionState, SessionType, RECEIVE_QUEUE_CAPACITY};
use crate::context::{MessageContext, ReceivedMessage, DEFAULT_PAYLOAD_TYPE};
use crate::crypto::{EpochKeys, EpochSecret, KeyExchange, Sealed, SessionKey};
use crate::error::{Result, SlimError};
use crate::protocol::{Payload, SessionEnvelope, SessionMessage};

/// State shared by an app and all of its sessions.
pub(crate) struct Shared {
    pub name: Name,
    pub processor: MessageProcessor,
    pub auth: Authenticator,
}

impl Shared {
    pub(crate) async fn send(
        &self,
        destination: &Name,
        fanout: u32,
        preferred: Option<ConnectionId>,
        envelope: &SessionEnvelope,
    ) -> Result<()> {
        let message = Message::new(
            self.name.clone(),
            destination.clone(),
            fanout,
            MessageBody::Session(envelope.encode()?),
        )
        .with_identity(self.auth.token()?);
        self.processor.publish(&message, preferred).await?;
        Ok(())
    }

    /// Propagates a local (un)subscription to every open connection.
    pub(crate) async fn announce(&self, name: &Name, subscribe: bool) {
        let token = match self.auth.token() {
            Ok(token) => token,
            Err(e) => {
                warn!(name = %name, error = %e, "cannot announce subscription");
                return;
            }
        };
        for conn in self.processor.connections() {
            self.announce_on(conn.id, name, subscribe, &token).await;
        }
    }

    pub(crate) async fn announce_on(
        &self,
        conn_id: ConnectionId,
        name: &Name,
        subscribe: bool,
        token: &str,
    ) {
        let message = if subscribe {
            Message::subscribe(self.name.clone(), name.clone())
        } else {
            Message::unsubscribe(self.name.clone(), name.clone())
        }
        .with_identity(token);
        if let Err(e) = self.processor.send_to(conn_id, &message).await {
            debug!(conn_id, name = %name, error = %e, "subscription announce failed");
        }
    }
}

/// A verified session message handed over by the app dispatcher.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub source: Name,
    pub destination: Name,
    pub input_connection: ConnectionId,
    pub identity: String,
    pub envelope: SessionEnvelope,
}

#[derive(Debug)]
struct Ack {
    from: Name,
    input_connection: ConnectionId,
    message: SessionMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFailure {
    Exhausted,
    Closed,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Members other than the moderator, with the connection their invite
    /// acknowledgement arrived on. Moderator only.
    members: BTreeMap<Name, ConnectionId>,
    participants: Vec<Name>,
    epoch: u64,
}

#[derive(Debug, Default)]
struct CryptoState {
    keys: Option<EpochKeys>,
    pairwise: HashMap<Name, SessionKey>,
}

pub(crate) struct SessionParams {
    pub id: u32,
    pub initiator: Name,
    pub wire_id: u32,
    pub config: SessionConfig,
    pub destination: Name,
    pub is_initiator: bool,
}

pub(crate) struct SessionInner {
    id: u32,
    initiator: Name,
    wire_id: u32,
    config: SessionConfig,
    shared: Arc<Shared>,
    destination: RwLock<Name>,
    is_initiator: bool,
    state: Mutex<SessionState>,
    deleted: AtomicBool,
    peer_connection: Mutex<Option<ConnectionId>>,
    queue_tx: Mutex<Option<mpsc::Sender<ReceivedMessage>>>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<ReceivedMessage>>,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<Ack>>>,
    next_correlation: AtomicU64,
    closed: watch::Sender<bool>,
    membership: tokio::sync::Mutex<()>,
    group: Mutex<GroupState>,
    crypto: Mutex<CryptoState>,
    /// Answer to the opening request, replayed on retransmissions.
    handshake_reply: Mutex<Option<SessionMessage>>,
}

/// Removes a pending request entry however the request ends.
struct PendingGuard<'a> {
    session: &'a SessionInner,
    correlation_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.pending.lock().remove(&self.correlation_id);
    }
}

impl SessionInner {
    pub(crate) fn new(params: SessionParams, shared: Arc<Shared>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: params.id,
            initiator: params.initiator,
            wire_id: params.wire_id,
            config: params.config,
            shared,
            destination: RwLock::new(params.destination),
            is_initiator: params.is_initiator,
            state: Mutex::new(SessionState::Init),
            deleted: AtomicBool::new(false),
            peer_connection: Mutex::new(None),
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            closed,
            membership: tokio::sync::Mutex::new(()),
            group: Mutex::new(GroupState::default()),
            crypto: Mutex::new(CryptoState::default()),
            handshake_reply: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// `(initiator, initiator's session id)`.
    pub(crate) fn wire_key(&self) -> (Name, u32) {
        (self.initiator.clone(), self.wire_id)
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn destination(&self) -> Name {
        self.destination.read().clone()
    }

    fn mls(&self) -> bool {
        self.config.mls_enabled
    }

    fn crypto_context(&self) -> Vec<u8> {
        format!("{}|{}", self.initiator, self.wire_id).into_bytes()
    }

    fn ensure_established(&self) -> Result<()> {
        match self.state() {
            SessionState::Established => Ok(()),
            SessionState::Closing | SessionState::Closed => {
                Err(SlimError::SessionError("session closed".to_string()))
            }
            SessionState::Init | SessionState::Handshaking => {
                Err(SlimError::SessionError("session not established".to_string()))
            }
        }
    }

    fn envelope(&self, correlation_id: Option<u64>, message: SessionMessage) -> SessionEnvelope {
        SessionEnvelope {
            initiator: self.initiator.clone(),
            session_id: self.wire_id,
            session_type: self.config.session_type,
            from_initiator: self.is_initiator,
            correlation_id,
            message,
        }
    }

    /// Sends `message` and retransmits it until `done` accepts an answer.
    /// Returns every answer seen.
    async fn request<F>(
        &self,
        destination: &Name,
        fanout: u32,
        preferred: Option<ConnectionId>,
        message: SessionMessage,
        attempts: u32,
        mut done: F,
    ) -> std::result::Result<Vec<Ack>, RequestFailure>
    where
        F: FnMut(&Ack) -> bool,
    {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(correlation_id, tx);
        let _guard = PendingGuard {
            session: self,
            correlation_id,
        };
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(RequestFailure::Closed);
        }

        let envelope = self.envelope(Some(correlation_id), message);
        let mut answers = Vec::new();
        for attempt in 1..=attempts.max(1) {
            if let Err(e) = self.shared.send(destination, fanout, preferred, &envelope).await {
                debug!(
                    session_id = self.id,
                    attempt,
                    kind = envelope.message.name(),
                    error = %e,
                    "send failed, will retry"
                );
            }
            let timer = tokio::time::sleep(self.config.interval());
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    ack = rx.recv() => {
                        let Some(ack) = ack else {
                            return Err(RequestFailure::Closed);
                        };
                        let finished = done(&ack);
                        answers.push(ack);
                        if finished {
                            return Ok(answers);
                        }
                    }
                    _ = &mut timer => break,
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            return Err(RequestFailure::Closed);
                        }
                    }
                }
            }
            debug!(
                session_id = self.id,
                attempt,
                kind = envelope.message.name(),
                "no answer within interval"
            );
        }
        Err(RequestFailure::Exhausted)
    }

    fn resolve(&self, correlation_id: u64, ack: Ack) {
        let pending = self.pending.lock();
        match pending.get(&correlation_id) {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => debug!(
                session_id = self.id,
                correlation_id,
                kind = ack.message.name(),
                "late answer ignored"
            ),
        }
    }

    async fn respond(
        &self,
        destination: &Name,
        input_connection: ConnectionId,
        correlation_id: Option<u64>,
        message: SessionMessage,
    ) {
        let envelope = self.envelope(correlation_id, message);
        if let Err(e) = self
            .shared
            .send(destination, UNICAST, Some(input_connection), &envelope)
            .await
        {
            warn!(
                session_id = self.id,
                kind = envelope.message.name(),
                error = %e,
                "failed to answer"
            );
        }
    }

    /// Initiator side of a point-to-point handshake.
    pub(crate) async fn open(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::Handshaking);
        let exchange = if self.mls() {
            Some(KeyExchange::new()?)
        } else {
            None
        };
        let open = SessionMessage::Open {
            mls: self.mls(),
            metadata: self.config.metadata.clone(),
            public_key: exchange.as_ref().map(|k| k.public_key().to_vec()),
        };
        let destination = self.destination();
        let answer = self
            .request(
                &destination,
                UNICAST,
                None,
                open,
                self.config.attempts(),
                |ack| {
                    matches!(
                        ack.message,
                        SessionMessage::OpenAck { .. } | SessionMessage::OpenReject { .. }
                    )
                },
            )
            .await
            .ok()
            .and_then(|mut answers| answers.pop());
        let Some(ack) = answer else {
            self.close_local();
            return Err(SlimError::SessionError(format!(
                "handshake with {} not acknowledged",
                destination
            )));
        };

        match ack.message {
            SessionMessage::OpenAck { public_key } => {
                if let Some(exchange) = exchange {
                    let Some(peer_public) = public_key else {
                        self.close_local();
                        return Err(SlimError::SessionError("mls mismatch".to_string()));
                    };
                    let key = match exchange.derive(&peer_public, &self.crypto_context()) {
                        Ok(key) => key,
                        Err(e) => {
                            self.close_local();
                            return Err(e);
                        }
                    };
                    self.crypto.lock().keys = Some(EpochKeys::new(0, key));
                }
                *self.destination.write() = ack.from.clone();
                *self.peer_connection.lock() = Some(ack.input_connection);
                self.set_state(SessionState::Established);
                info!(session_id = self.id, peer = %ack.from, "session established");
                Ok(())
            }
            SessionMessage::OpenReject { reason } => {
                self.close_local();
                Err(SlimError::SessionError(reason))
            }
            other => {
                self.close_local();
                Err(SlimError::InternalError(format!(
                    "unexpected answer {}",
                    other.name()
                )))
            }
        }
    }

    /// Initiator side of a group: the moderator alone, subscribed to the group.
    pub(crate) async fn start_group(self: &Arc<Self>) -> Result<()> {
        let group = self.destination();
        self.shared.processor.subscribe(&group, None)?;
        self.shared.announce(&group, true).await;
        if self.mls() {
            let secret = EpochSecret::random();
            let key = SessionKey::from_epoch_secret(&secret, &self.crypto_context())?;
            self.crypto.lock().keys = Some(EpochKeys::new(0, key));
        }
        self.group.lock().participants = vec![self.shared.name.clone()];
        self.set_state(SessionState::Established);
        info!(session_id = self.id, group = %group, "group session established");
        Ok(())
    }

    /// Responder side of `Open`. Returns the answer to send.
    pub(crate) fn accept_open(
        &self,
        peer: &Name,
        input_connection: ConnectionId,
        peer_public: Option<&[u8]>,
    ) -> Result<SessionMessage> {
        self.set_state(SessionState::Handshaking);
        let public_key = if self.mls() {
            let peer_public = peer_public
                .ok_or_else(|| SlimError::SessionError("mls mismatch".to_string()))?;
            let exchange = KeyExchange::new()?;
            let public = exchange.public_key().to_vec();
            let key = exchange.derive(peer_public, &self.crypto_context())?;
            self.crypto.lock().keys = Some(EpochKeys::new(0, key));
            Some(public)
        } else {
            None
        };
        *self.destination.write() = peer.clone();
        *self.peer_connection.lock() = Some(input_connection);
        let reply = SessionMessage::OpenAck { public_key };
        *self.handshake_reply.lock() = Some(reply.clone());
        self.set_state(SessionState::Established);
        Ok(reply)
    }

    /// Invitee side of `Invite`: joins the group and returns the answer.
    pub(crate) async fn accept_invite(
        &self,
        moderator: &Name,
        input_connection: ConnectionId,
        moderator_public: Option<&[u8]>,
    ) -> Result<SessionMessage> {
        self.set_state(SessionState::Handshaking);
        let public_key = if self.mls() {
            let moderator_public = moderator_public
                .ok_or_else(|| SlimError::SessionError("mls mismatch".to_string()))?;
            let exchange = KeyExchange::new()?;
            let public = exchange.public_key().to_vec();
            let key = exchange.derive(moderator_public, &self.crypto_context())?;
            self.crypto
                .lock()
                .pairwise
                .insert(moderator.clone(), key);
            Some(public)
        } else {
            None
        };

        let group = self.destination();
        let processor = &self.shared.processor;
        processor.subscribe(&group, None)?;
        self.shared.announce(&group, true).await;
        if !processor.fabric().has_route(&group) {
            processor.set_route(&group, input_connection)?;
        }
        *self.peer_connection.lock() = Some(input_connection);
        self.group.lock().participants =
            vec![moderator.clone(), self.shared.name.clone()];

        let reply = SessionMessage::InviteAck { public_key };
        *self.handshake_reply.lock() = Some(reply.clone());
        self.set_state(SessionState::Established);
        info!(session_id = self.id, group = %group, moderator = %moderator, "joined group");
        Ok(reply)
    }

    /// Handles a message addressed to this session.
    pub(crate) async fn on_message(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            source,
            destination,
            input_connection,
            identity,
            envelope,
        } = inbound;
        let correlation_id = envelope.correlation_id;

        if envelope.message.is_response() {
            if let Some(correlation_id) = correlation_id {
                self.resolve(
                    correlation_id,
                    Ack {
                        from: source,
                        input_connection,
                        message: envelope.message,
                    },
                );
            }
            return;
        }
        if self.state() == SessionState::Closed {
            debug!(session_id = self.id, kind = envelope.message.name(), "session closed, dropped");
            return;
        }

        match envelope.message {
            SessionMessage::Open { .. } | SessionMessage::Invite { .. } => {
                let reply = self.handshake_reply.lock().clone();
                if let Some(reply) = reply {
                    self.respond(&source, input_connection, correlation_id, reply)
                        .await;
                }
            }
            SessionMessage::GroupUpdate {
                epoch,
                participants,
                secret,
            } => match self.apply_update(&source, epoch, participants, secret) {
                Ok(()) => {
                    if correlation_id.is_some() {
                        self.respond(
                            &source,
                            input_connection,
                            correlation_id,
                            SessionMessage::GroupUpdateAck,
                        )
                        .await;
                    }
                }
                Err(e) => warn!(session_id = self.id, error = %e, "group update rejected"),
            },
            SessionMessage::Remove => {
                if correlation_id.is_some() {
                    self.respond(
                        &source,
                        input_connection,
                        correlation_id,
                        SessionMessage::RemoveAck,
                    )
                    .await;
                }
                info!(session_id = self.id, "removed from group");
                self.close_local();
            }
            SessionMessage::Close => {
                if correlation_id.is_some() {
                    self.respond(
                        &source,
                        input_connection,
                        correlation_id,
                        SessionMessage::CloseAck,
                    )
                    .await;
                }
                info!(session_id = self.id, peer = %source, "closed by peer");
                self.close_local();
            }
            SessionMessage::Publish {
                payload_type,
                metadata,
                payload,
            } => {
                let context = MessageContext {
                    source_name: source,
                    destination_name: Some(destination),
                    payload_type,
                    metadata,
                    input_connection,
                    identity,
                };
                self.deliver(context, payload, correlation_id).await;
            }
            other => debug!(session_id = self.id, kind = other.name(), "unexpected message"),
        }
    }

    fn apply_update(
        &self,
        from: &Name,
        epoch: u64,
        participants: Vec<Name>,
        secret: Option<Sealed>,
    ) -> Result<()> {
        if let Some(sealed) = secret {
            let context = self.crypto_context();
            let mut guard = self.crypto.lock();
            let crypto = &mut *guard;
            let pairwise = crypto
                .pairwise
                .get(from)
                .ok_or_else(|| SlimError::SessionError("no key shared with moderator".to_string()))?;
            let bytes = Zeroizing::new(pairwise.open(self.wire_id, &sealed)?);
            let secret = EpochSecret::from_bytes(&bytes)?;
            let key = SessionKey::from_epoch_secret(&secret, &context)?;
            match crypto.keys.as_mut() {
                Some(keys) => {
                    keys.rotate(epoch, key);
                }
                None => crypto.keys = Some(EpochKeys::new(epoch, key)),
            }
        }
        let mut group = self.group.lock();
        if epoch >= group.epoch {
            group.epoch = epoch;
            group.participants = participants;
        }
        debug!(session_id = self.id, epoch, "group update applied");
        Ok(())
    }

    async fn deliver(
        &self,
        context: MessageContext,
        payload: Payload,
        correlation_id: Option<u64>,
    ) {
        if self.config.session_type == SessionType::Group
            && context.source_name == self.shared.name
        {
            return;
        }
        let payload = match payload {
            Payload::Plain(_) if self.mls() => {
                warn!(session_id = self.id, "unencrypted payload on encrypted session dropped");
                return;
            }
            Payload::Plain(bytes) => bytes,
            Payload::Sealed(sealed) => {
                let opened = match self.crypto.lock().keys.as_ref() {
                    Some(keys) => keys.open(self.wire_id, &sealed),
                    None => Err(SlimError::ReceiveError("no session key".to_string())),
                };
                match opened {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(session_id = self.id, error = %e, "payload dropped");
                        return;
                    }
                }
            }
        };

        let Some(queue) = self.queue_tx.lock().clone() else {
            return;
        };
        let source = context.source_name.clone();
        let input_connection = context.input_connection;
        match queue.try_send(ReceivedMessage { context, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = self.id, "receive queue full, message dropped");
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
        if correlation_id.is_some() {
            self.respond(
                &source,
                input_connection,
                correlation_id,
                SessionMessage::PublishAck,
            )
            .await;
        }
    }

    fn seal(&self, payload: Vec<u8>) -> Result<Payload> {
        if !self.mls() {
            return Ok(Payload::Plain(payload));
        }
        let crypto = self.crypto.lock();
        let keys = crypto
            .keys
            .as_ref()
            .ok_or_else(|| SlimError::SessionError("session key not established".to_string()))?;
        Ok(Payload::Sealed(keys.seal(self.wire_id, &payload)?))
    }

    /// Publishes on the session, or to `target` when replying. With
    /// `confirmed` the returned handle resolves once every recipient
    /// acknowledged.
    async fn publish(
        self: &Arc<Self>,
        target: Option<(Name, ConnectionId)>,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
        confirmed: bool,
    ) -> Result<Option<CompletionHandle>> {
        self.ensure_established()?;
        let message = SessionMessage::Publish {
            payload_type: payload_type.unwrap_or_else(|| DEFAULT_PAYLOAD_TYPE.to_string()),
            metadata: metadata.unwrap_or_default(),
            payload: self.seal(payload)?,
        };
        let (destination, fanout, preferred) = match target {
            Some((name, conn)) => (name, UNICAST, Some(conn)),
            None => match self.config.session_type {
                SessionType::PointToPoint => {
                    (self.destination(), UNICAST, *self.peer_connection.lock())
                }
                SessionType::Group => (self.destination(), BROADCAST, None),
            },
        };

        if !confirmed {
            let envelope = self.envelope(None, message);
            self.shared
                .send(&destination, fanout, preferred, &envelope)
                .await?;
            return Ok(None);
        }

        let broadcast = fanout == BROADCAST;
        let mut expected: HashSet<Name> = if broadcast {
            self.group
                .lock()
                .participants
                .iter()
                .filter(|p| **p != self.shared.name)
                .cloned()
                .collect()
        } else {
            HashSet::new()
        };
        if broadcast && expected.is_empty() {
            return Ok(Some(CompletionHandle::ready(Ok(()))));
        }

        let (tx, handle) = completion();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let attempts = session.config.attempts();
            let result = session
                .request(&destination, fanout, preferred, message, attempts, move |ack| {
                    if !matches!(ack.message, SessionMessage::PublishAck) {
                        return false;
                    }
                    if !broadcast {
                        return true;
                    }
                    expected.remove(&ack.from);
                    expected.is_empty()
                })
                .await;
            tx.complete(match result {
                Ok(_) => Ok(()),
                Err(RequestFailure::Exhausted) => {
                    warn!(session_id = session.id, destination = %destination, "delivery not confirmed");
                    Err(SlimError::SendError("delivery not confirmed".to_string()))
                }
                Err(RequestFailure::Closed) => {
                    Err(SlimError::SessionError("session closed".to_string()))
                }
            });
        });
        Ok(Some(handle))
    }

    fn require_moderator(&self) -> Result<()> {
        if self.config.session_type != SessionType::Group {
            return Err(SlimError::InvalidArgument(
                "membership changes need a group session".to_string(),
            ));
        }
        if !self.is_initiator {
            return Err(SlimError::InvalidArgument(
                "only the moderator changes membership".to_string(),
            ));
        }
        Ok(())
    }

    async fn invite_participant(self: &Arc<Self>, participant: Name) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.ensure_established()?;

        let exchange = if self.mls() {
            Some(KeyExchange::new()?)
        } else {
            None
        };
        let invite = SessionMessage::Invite {
            group: self.destination(),
            mls: self.mls(),
            metadata: self.config.metadata.clone(),
            public_key: exchange.as_ref().map(|k| k.public_key().to_vec()),
        };
        let ack = match self
            .request(
                &participant,
                UNICAST,
                None,
                invite,
                self.config.attempts(),
                |ack| {
                    matches!(
                        ack.message,
                        SessionMessage::InviteAck { .. } | SessionMessage::InviteReject { .. }
                    )
                },
            )
            .await
        {
            Ok(mut answers) => answers
                .pop()
                .ok_or_else(|| SlimError::InternalError("missing invite answer".to_string()))?,
            Err(RequestFailure::Closed) => {
                return Err(SlimError::SessionError("session closed".to_string()))
            }
            Err(RequestFailure::Exhausted) => {
                return Err(SlimError::SessionError(format!(
                    "invite to {} not acknowledged",
                    participant
                )))
            }
        };

        let member = ack.from.clone();
        match ack.message {
            SessionMessage::InviteAck { public_key } => {
                if let Some(exchange) = exchange {
                    let peer_public =
                        public_key.ok_or_else(|| SlimError::SessionError("mls mismatch".to_string()))?;
                    let key = exchange.derive(&peer_public, &self.crypto_context())?;
                    self.crypto.lock().pairwise.insert(member.clone(), key);
                }
            }
            SessionMessage::InviteReject { reason } => return Err(SlimError::SessionError(reason)),
            other => {
                return Err(SlimError::InternalError(format!(
                    "unexpected answer {}",
                    other.name()
                )))
            }
        }

        let group = self.destination();
        let processor = &self.shared.processor;
        if !processor.fabric().has_route(&group) {
            if let Err(e) = processor.set_route(&group, ack.input_connection) {
                debug!(session_id = self.id, error = %e, "group route not installed");
            }
        }
        {
            let mut state = self.group.lock();
            state.members.insert(member.clone(), ack.input_connection);
            if !state.participants.contains(&member) {
                state.participants.push(member.clone());
            }
        }

        let failed = self.distribute_update().await?;
        if failed.contains(&member) {
            return Err(SlimError::SessionError(format!(
                "{} did not confirm membership",
                member
            )));
        }
        info!(session_id = self.id, member = %member, "participant invited");
        Ok(())
    }

    async fn remove_participant(self: &Arc<Self>, participant: Name) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.ensure_established()?;

        let member = {
            let state = self.group.lock();
            state
                .members
                .iter()
                .find(|(name, _)| **name == participant || name.matches(&participant))
                .map(|(name, conn)| (name.clone(), *conn))
        };
        let Some((member, conn)) = member else {
            return Err(SlimError::InvalidArgument(format!(
                "{} is not a participant",
                participant
            )));
        };

        let result = self
            .request(
                &member,
                UNICAST,
                Some(conn),
                SessionMessage::Remove,
                self.config.attempts(),
                |ack| matches!(ack.message, SessionMessage::RemoveAck),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(RequestFailure::Closed) => {
                return Err(SlimError::SessionError("session closed".to_string()))
            }
            Err(RequestFailure::Exhausted) => {
                return Err(SlimError::SessionError(format!(
                    "removal of {} not acknowledged",
                    member
                )))
            }
        }

        {
            let mut state = self.group.lock();
            state.members.remove(&member);
            state.participants.retain(|p| *p != member);
        }
        self.crypto.lock().pairwise.remove(&member);
        let failed = self.distribute_update().await?;
        if !failed.is_empty() {
            warn!(session_id = self.id, unconfirmed = failed.len(), "group update not confirmed by every member");
        }
        info!(session_id = self.id, member = %member, "participant removed");
        Ok(())
    }

    /// Starts a new epoch and pushes it to every member. Returns the members
    /// that did not confirm. Called with the membership lock held.
    async fn distribute_update(&self) -> Result<Vec<Name>> {
        let (epoch, participants, members) = {
            let mut state = self.group.lock();
            state.epoch += 1;
            (
                state.epoch,
                state.participants.clone(),
                state
                    .members
                    .iter()
                    .map(|(name, conn)| (name.clone(), *conn))
                    .collect::<Vec<_>>(),
            )
        };
        let secret = if self.mls() {
            let secret = EpochSecret::random();
            let key = SessionKey::from_epoch_secret(&secret, &self.crypto_context())?;
            let mut crypto = self.crypto.lock();
            match crypto.keys.as_mut() {
                Some(keys) => {
                    keys.rotate(epoch, key);
                }
                None => crypto.keys = Some(EpochKeys::new(epoch, key)),
            }
            Some(secret)
        } else {
            None
        };

        let mut failed = Vec::new();
        for (member, conn) in members {
            let sealed = match &secret {
                Some(secret) => {
                    let crypto = self.crypto.lock();
                    let Some(pairwise) = crypto.pairwise.get(&member) else {
                        warn!(session_id = self.id, member = %member, "no key shared with member");
                        failed.push(member);
                        continue;
                    };
                    Some(pairwise.seal(self.wire_id, epoch, secret.as_bytes())?)
                }
                None => None,
            };
            let update = SessionMessage::GroupUpdate {
                epoch,
                participants: participants.clone(),
                secret: sealed,
            };
            let result = self
                .request(
                    &member,
                    UNICAST,
                    Some(conn),
                    update,
                    self.config.attempts(),
                    |ack| matches!(ack.message, SessionMessage::GroupUpdateAck),
                )
                .await;
            if result.is_err() {
                warn!(session_id = self.id, member = %member, epoch, "group update not confirmed");
                failed.push(member);
            }
        }
        debug!(session_id = self.id, epoch, "group update distributed");
        Ok(failed)
    }

    /// Marks the session deleted. Fails on the second call.
    pub(crate) fn mark_deleted(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Err(SlimError::InvalidArgument(
                "session already deleted".to_string(),
            ));
        }
        Ok(())
    }

    /// Tells the peer(s) the session is over, then closes locally.
    pub(crate) async fn terminate(self: &Arc<Self>) {
        if self.state() == SessionState::Established {
            self.set_state(SessionState::Closing);
            match (self.config.session_type, self.is_initiator) {
                (SessionType::PointToPoint, _) => {
                    let destination = self.destination();
                    let preferred = *self.peer_connection.lock();
                    let _ = self
                        .request(&destination, UNICAST, preferred, SessionMessage::Close, 1, |ack| {
                            matches!(ack.message, SessionMessage::CloseAck)
                        })
                        .await;
                }
                (SessionType::Group, true) => {
                    let envelope = self.envelope(None, SessionMessage::Close);
                    if let Err(e) = self
                        .shared
                        .send(&self.destination(), BROADCAST, None, &envelope)
                        .await
                    {
                        debug!(session_id = self.id, error = %e, "group close not sent");
                    }
                }
                (SessionType::Group, false) => {}
            }
        }
        self.close_local();
    }

    /// Moves to `Closed`, fails pending requests and ends the receive queue.
    pub(crate) fn close_local(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.closed.send_replace(true);
        self.pending.lock().clear();
        self.queue_tx.lock().take();

        if self.config.session_type == SessionType::Group {
            let group = self.destination();
            if self.shared.processor.unsubscribe(&group, None).is_ok() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let shared = Arc::clone(&self.shared);
                    handle.spawn(async move { shared.announce(&group, false).await });
                }
            }
        }
        info!(session_id = self.id, "session closed");
    }

    async fn get_message(&self, timeout: Option<Duration>) -> Result<ReceivedMessage> {
        let mut queue = self
            .queue_rx
            .try_lock()
            .map_err(|_| SlimError::InvalidArgument("concurrent receive".to_string()))?;
        let next = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, queue.recv())
                .await
                .map_err(|_| SlimError::Timeout)?,
            None => queue.recv().await,
        };
        next.ok_or_else(|| SlimError::SessionError("session closed".to_string()))
    }
}

/// Handle to a session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("type", &self.inner.config.session_type)
            .field("destination", &self.inner.destination())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Local id. Not globally unique.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Point-to-point or group.
    pub fn session_type(&self) -> SessionType {
        self.inner.config.session_type
    }

    /// Settings the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Name of the local app.
    pub fn source(&self) -> Name {
        self.inner.shared.name.clone()
    }

    /// Peer name for point-to-point sessions (pinned to the responding app
    /// once established), group name otherwise.
    pub fn destination(&self) -> Name {
        self.inner.destination()
    }

    /// True on the side that created the session.
    pub fn is_initiator(&self) -> bool {
        self.inner.is_initiator
    }

    /// Metadata set by the creator.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.inner.config.metadata.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Both endpoints for point-to-point, current members for groups.
    pub fn participants(&self) -> Vec<Name> {
        match self.inner.config.session_type {
            SessionType::PointToPoint => vec![self.source(), self.destination()],
            SessionType::Group => self.inner.group.lock().participants.clone(),
        }
    }

    /// Fire-and-forget publish. Succeeds once the message is queued on a
    /// connection.
    pub async fn publish(
        &self,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        self.inner
            .publish(None, payload, payload_type, metadata, false)
            .await
            .map(|_| ())
    }

    /// Publish whose handle resolves when delivery is acknowledged, or with
    /// `SendError` once the retry budget is spent.
    pub async fn publish_with_completion(
        &self,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<CompletionHandle> {
        self.inner
            .publish(None, payload, payload_type, metadata, true)
            .await?
            .ok_or_else(|| SlimError::InternalError("missing completion handle".to_string()))
    }

    /// Replies to the sender of a received message, preferring the connection
    /// it arrived on.
    pub async fn publish_to(
        &self,
        context: &MessageContext,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let target = (context.source_name.clone(), context.input_connection);
        self.inner
            .publish(Some(target), payload, payload_type, metadata, false)
            .await
            .map(|_| ())
    }

    /// Like [`Session::publish_to`] with a completion handle.
    pub async fn publish_to_with_completion(
        &self,
        context: &MessageContext,
        payload: Vec<u8>,
        payload_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<CompletionHandle> {
        let target = (context.source_name.clone(), context.input_connection);
        self.inner
            .publish(Some(target), payload, payload_type, metadata, true)
            .await?
            .ok_or_else(|| SlimError::InternalError("missing completion handle".to_string()))
    }

    /// Invites `participant` into a group session. Moderator only.
    pub async fn invite(&self, participant: &Name) -> Result<CompletionHandle> {
        self.inner.require_moderator()?;
        self.inner.ensure_established()?;
        let (tx, handle) = completion();
        let session = Arc::clone(&self.inner);
        let participant = participant.clone();
        tokio::spawn(async move {
            let result = session.invite_participant(participant).await;
            if let Err(e) = &result {
                warn!(session_id = session.id, error = %e, "invite failed");
            }
            tx.complete(result);
        });
        Ok(handle)
    }

    /// Removes `participant` from a group session. Moderator only.
    pub async fn remove(&self, participant: &Name) -> Result<CompletionHandle> {
        self.inner.require_moderator()?;
        self.inner.ensure_established()?;
        let (tx, handle) = completion();
        let session = Arc::clone(&self.inner);
        let participant = participant.clone();
        tokio::spawn(async move {
            let result = session.remove_participant(participant).await;
            tx.complete(result);
        });
        Ok(handle)
    }

    /// Next received message. `None` waits indefinitely.
    pub async fn get_message(&self, timeout: Option<Duration>) -> Result<ReceivedMessage> {
        self.inner.get_message(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<Shared> {
        let name = Name::new(["org", "ns", "unit"], Some(1)).unwrap();
        let (processor, _deliveries) = MessageProcessor::new();
        let auth = Authenticator::from_config(
            &name.to_string(),
            &crate::auth::AuthConfig::SharedSecret {
                secret: "0123456789abcdef0123456789abcdef".to_string(),
            },
        )
        .unwrap();
        Arc::new(Shared {
            name,
            processor,
            auth,
        })
    }

    fn session(shared: Arc<Shared>, config: SessionConfig) -> Arc<SessionInner> {
        let initiator = shared.name.clone();
        SessionInner::new(
            SessionParams {
                id: 7,
                initiator,
                wire_id: 7,
                config,
                destination: Name::new(["org", "ns", "peer"], None).unwrap(),
                is_initiator: true,
            },
            shared,
        )
    }

    #[tokio::test]
    async fn test_publish_requires_established() {
        let s = session(shared(), SessionConfig::point_to_point());
        let err = s.publish(None, vec![1], None, None, false).await.unwrap_err();
        assert_eq!(err, SlimError::SessionError("session not established".to_string()));
    }

    #[tokio::test]
    async fn test_handshake_without_route_fails() {
        let s = session(
            shared(),
            SessionConfig::point_to_point().with_retries(1, 20),
        );
        let err = s.open().await.unwrap_err();
        assert!(matches!(err, SlimError::SessionError(_)));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_ends_receive_queue() {
        let s = session(shared(), SessionConfig::point_to_point());
        s.close_local();
        let err = s.get_message(Some(Duration::from_millis(10))).await.unwrap_err();
        assert_eq!(err, SlimError::SessionError("session closed".to_string()));
    }

    #[tokio::test]
    async fn test_get_message_timeout() {
        let s = session(shared(), SessionConfig::point_to_point());
        let err = s.get_message(Some(Duration::from_millis(10))).await.unwrap_err();
        assert_eq!(err, SlimError::Timeout);
    }

    #[tokio::test]
    async fn test_concurrent_receive_rejected() {
        let s = session(shared(), SessionConfig::point_to_point());
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.get_message(Some(Duration::from_millis(200))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = s.get_message(Some(Duration::from_millis(10))).await.unwrap_err();
        assert_eq!(err, SlimError::InvalidArgument("concurrent receive".to_string()));
        assert_eq!(waiter.await.unwrap().unwrap_err(), SlimError::Timeout);
    }

    #[tokio::test]
    async fn test_mark_deleted_once() {
        let s = session(shared(), SessionConfig::point_to_point());
        assert!(s.mark_deleted().is_ok());
        assert!(matches!(s.mark_deleted(), Err(SlimError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_group_moderator_alone() {
        let shared = shared();
        let s = session(Arc::clone(&shared), SessionConfig::group());
        s.start_group().await.unwrap();
        let handle = Session::from_inner(Arc::clone(&s));
        assert_eq!(handle.participants(), vec![shared.name.clone()]);
        // No members to confirm.
        let done = handle
            .publish_with_completion(vec![1], None, None)
            .await
            .unwrap();
        assert_eq!(done.wait().await, Ok(()));
        assert!(shared
            .processor
            .fabric()
            .is_subscribed(&handle.destination(), None));
        s.close_local();
        assert!(!shared
            .processor
            .fabric()
            .is_subscribed(&handle.destination(), None));
    }

    #[tokio::test]
    async fn test_membership_needs_group_moderator() {
        let s = session(shared(), SessionConfig::point_to_point());
        let handle = Session::from_inner(s);
        let peer = Name::new(["org", "ns", "x"], None).unwrap();
        assert!(matches!(
            handle.invite(&peer).await,
            Err(SlimError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_sealed_group_payload_roundtrip() {
        let s = session(shared(), SessionConfig::group().with_mls(true));
        s.start_group().await.unwrap();
        let Payload::Sealed(sealed) = s.seal(b"secret".to_vec()).unwrap() else {
            panic!("expected sealed payload");
        };
        let keys = s.crypto.lock();
        assert_eq!(
            keys.keys.as_ref().unwrap().open(s.wire_id, &sealed).unwrap(),
            b"secret"
        );
    }
}
