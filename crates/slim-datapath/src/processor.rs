//! Message processor: glues the transport surface, the fabric and the local
//! delivery queue.
//!
//! Inbound frames are decoded and either applied to the fabric (subscription
//! control) or forwarded according to it. Forwarding never sends a message
//! back over the connection it arrived on, and never hands a locally
//! originated message back to the local queue.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slim_transport::{
    ClientConfig, ConnectionId, ConnectionInfo, Frame, ServerConfig, SurfaceEvent,
    TransportSurface,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DatapathError, Result};
use crate::fabric::{Action, Fabric};
use crate::message::{Message, MessageBody};
use crate::metrics::{DatapathMetrics, DatapathMetricsSnapshot};
use crate::name::Name;

/// Depth of the local delivery queue.
pub const DELIVERY_QUEUE_CAPACITY: usize = 4096;

/// A message handed to the local endpoint.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The routed message.
    pub message: Message,
    /// Connection the message arrived on.
    pub input_connection: ConnectionId,
}

struct ProcessorInner {
    surface: TransportSurface,
    fabric: Fabric,
    local: mpsc::Sender<Delivery>,
    metrics: DatapathMetrics,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ProcessorInner {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
        self.surface.shutdown();
    }
}

/// Handle to one message processor. Clones share state.
#[derive(Clone)]
pub struct MessageProcessor {
    inner: Arc<ProcessorInner>,
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("surface", &self.inner.surface)
            .finish()
    }
}

impl MessageProcessor {
    /// Starts a processor and returns it with the local delivery queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> (Self, mpsc::Receiver<Delivery>) {
        let (surface, events) = TransportSurface::new();
        let (local, deliveries) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let inner = Arc::new(ProcessorInner {
            surface,
            fabric: Fabric::new(),
            local,
            metrics: DatapathMetrics::new(),
            event_task: Mutex::new(None),
        });
        let task = tokio::spawn(event_loop(Arc::downgrade(&inner), events));
        *inner.event_task.lock() = Some(task);
        (Self { inner }, deliveries)
    }

    /// Subscription and route tables.
    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    /// Connections and servers.
    pub fn surface(&self) -> &TransportSurface {
        &self.inner.surface
    }

    /// Dials a peer and returns the new connection id.
    pub async fn connect(&self, config: &ClientConfig) -> Result<ConnectionId> {
        Ok(self.inner.surface.connect(config).await?)
    }

    /// Closes one connection and purges what was learned through it.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        self.inner.surface.disconnect(conn_id)?;
        self.inner.fabric.purge_connection(conn_id);
        Ok(())
    }

    /// Starts a listener; returns the bound endpoint.
    pub async fn run_server(&self, config: &ServerConfig) -> Result<String> {
        Ok(self.inner.surface.run_server(config).await?)
    }

    /// Stops the listener on `endpoint` and its accepted connections.
    pub fn stop_server(&self, endpoint: &str) -> Result<()> {
        Ok(self.inner.surface.stop_server(endpoint)?)
    }

    /// True while `conn_id` is open.
    pub fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.inner.surface.is_connected(conn_id)
    }

    /// Open connections, outbound and accepted.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.surface.connections()
    }

    /// Adds a subscription; `None` means the local endpoint.
    pub fn subscribe(&self, name: &Name, connection: Option<ConnectionId>) -> Result<()> {
        if let Some(conn_id) = connection {
            self.ensure_connected(conn_id)?;
        }
        self.inner.fabric.subscribe(name, connection);
        Ok(())
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, name: &Name, connection: Option<ConnectionId>) -> Result<()> {
        self.inner.fabric.unsubscribe(name, connection)
    }

    /// Adds a fallback route over an open connection.
    pub fn set_route(&self, name: &Name, conn_id: ConnectionId) -> Result<()> {
        self.ensure_connected(conn_id)?;
        self.inner.fabric.set_route(name, conn_id);
        Ok(())
    }

    /// Removes a fallback route.
    pub fn remove_route(&self, name: &Name, conn_id: ConnectionId) -> Result<()> {
        self.inner.fabric.remove_route(name, conn_id)
    }

    fn ensure_connected(&self, conn_id: ConnectionId) -> Result<()> {
        if self.inner.surface.is_connected(conn_id) {
            Ok(())
        } else {
            Err(DatapathError::InvalidArgument(format!(
                "unknown connection {}",
                conn_id
            )))
        }
    }

    /// Sends a message directly over one connection, bypassing the fabric.
    pub async fn send_to(&self, conn_id: ConnectionId, message: &Message) -> Result<()> {
        let frame = message.to_frame()?;
        self.inner.surface.send(conn_id, &frame).await?;
        self.inner.metrics.inc_forwarded();
        Ok(())
    }

    /// Routes a locally originated message. `preferred` is tried first when it
    /// is still connected. Returns the number of copies sent.
    pub async fn publish(&self, message: &Message, preferred: Option<ConnectionId>) -> Result<usize> {
        let preferred = preferred.filter(|c| self.inner.surface.is_connected(*c));
        let actions = self.inner.fabric.forward_with(
            &message.destination,
            message.fanout,
            preferred,
            |a| *a != Action::Local,
        )?;
        let frame = message.to_frame()?;
        self.inner.send_actions(&actions, &frame).await
    }

    /// Current counters.
    pub fn metrics(&self) -> DatapathMetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.surface.metrics())
    }

    /// Stops all servers and closes all connections.
    pub fn shutdown(&self) {
        self.inner.surface.shutdown();
    }
}

impl ProcessorInner {
    async fn send_actions(&self, actions: &[Action], frame: &Frame) -> Result<usize> {
        let mut sent = 0;
        let mut last_err = None;
        for action in actions {
            let Action::Remote(conn_id) = action else {
                continue;
            };
            match self.surface.send(*conn_id, frame).await {
                Ok(()) => {
                    self.metrics.inc_forwarded();
                    sent += 1;
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "forward failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if sent == 0 => Err(e.into()),
            _ => Ok(sent),
        }
    }

    fn deliver_local(&self, message: Message, input_connection: ConnectionId) {
        match self.local.try_send(Delivery {
            message,
            input_connection,
        }) {
            Ok(()) => self.metrics.inc_delivered_local(),
            Err(mpsc::error::TrySendError::Full(d)) => {
                self.metrics.inc_dropped();
                warn!(destination = %d.message.destination, "local queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_dropped();
                debug!("local endpoint gone, message dropped");
            }
        }
    }

    async fn handle_frame(&self, conn_id: ConnectionId, frame: Frame) {
        let message = match Message::from_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.inc_dropped();
                warn!(conn_id, error = %e, "undecodable message dropped");
                return;
            }
        };

        match &message.body {
            MessageBody::Subscribe { name } => {
                self.fabric.subscribe(name, Some(conn_id));
            }
            MessageBody::Unsubscribe { name } => {
                if let Err(e) = self.fabric.unsubscribe(name, Some(conn_id)) {
                    debug!(conn_id, error = %e, "ignoring remote unsubscribe");
                }
            }
            MessageBody::Session(_) => {
                let actions = match self.fabric.forward_with(
                    &message.destination,
                    message.fanout,
                    None,
                    |a| *a != Action::Remote(conn_id),
                ) {
                    Ok(actions) => actions,
                    Err(e) => {
                        self.metrics.inc_dropped();
                        debug!(conn_id, destination = %message.destination, error = %e, "message dropped");
                        return;
                    }
                };
                if actions.iter().any(|a| matches!(a, Action::Remote(_))) {
                    if let Err(e) = self.send_actions(&actions, &frame).await {
                        debug!(conn_id, error = %e, "forwarding failed");
                    }
                }
                if actions.contains(&Action::Local) {
                    self.deliver_local(message, conn_id);
                }
            }
        }
    }
}

async fn event_loop(processor: Weak<ProcessorInner>, mut events: mpsc::Receiver<SurfaceEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = processor.upgrade() else {
            break;
        };
        match event {
            SurfaceEvent::Connected { conn_id, server } => {
                debug!(conn_id, server = ?server, "connection ready");
            }
            SurfaceEvent::Frame { conn_id, frame } => {
                inner.handle_frame(conn_id, frame).await;
            }
            SurfaceEvent::Closed { conn_id } => {
                let purged = inner.fabric.purge_connection(conn_id);
                info!(conn_id, purged, "connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BROADCAST, UNICAST};
    use std::time::Duration;

    fn svc(id: u64) -> Name {
        Name::new(["org", "ns", "svc"], Some(id)).unwrap()
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timeout")
            .expect("delivery channel closed")
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_unicast_through_router() {
        let (router, _router_rx) = MessageProcessor::new();
        let addr = router
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();

        let (a, _a_rx) = MessageProcessor::new();
        let (b, mut b_rx) = MessageProcessor::new();
        let a_conn = a.connect(&ClientConfig::insecure(addr.clone())).await.unwrap();
        let b_conn = b.connect(&ClientConfig::insecure(addr)).await.unwrap();

        b.subscribe(&svc(2), None).unwrap();
        b.send_to(b_conn, &Message::subscribe(svc(2), svc(2)))
            .await
            .unwrap();
        a.set_route(&svc(2), a_conn).unwrap();
        wait_for(|| router.fabric().subscriptions().len() == 1).await;

        let msg = Message::new(svc(1), svc(2), UNICAST, MessageBody::Session(vec![1, 2, 3]));
        assert_eq!(a.publish(&msg, None).await.unwrap(), 1);

        let delivery = recv(&mut b_rx).await;
        assert_eq!(delivery.message, msg);
        assert_eq!(delivery.input_connection, b_conn);
        wait_for(|| router.metrics().messages_forwarded == 1).await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let (router, mut router_rx) = MessageProcessor::new();
        let addr = router
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();
        let group = Name::new(["org", "ns", "group"], None).unwrap();

        let mut members = Vec::new();
        for id in 1..=3 {
            let (p, rx) = MessageProcessor::new();
            let conn = p.connect(&ClientConfig::insecure(addr.clone())).await.unwrap();
            p.subscribe(&group, None).unwrap();
            p.set_route(&group, conn).unwrap();
            p.send_to(conn, &Message::subscribe(svc(id), group.clone()))
                .await
                .unwrap();
            members.push((p, rx));
        }
        wait_for(|| router.fabric().subscriptions().len() == 3).await;

        let msg = Message::new(svc(1), group.clone(), BROADCAST, MessageBody::Session(vec![9]));
        members[0].0.publish(&msg, None).await.unwrap();

        for (_, rx) in members.iter_mut().skip(1) {
            assert_eq!(recv(rx).await.message, msg);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(members[0].1.try_recv().is_err());
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_route_and_purge() {
        let (router, _router_rx) = MessageProcessor::new();
        let addr = router
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();
        let (a, _a_rx) = MessageProcessor::new();

        let msg = Message::new(svc(1), svc(2), UNICAST, MessageBody::Session(vec![]));
        assert!(matches!(
            a.publish(&msg, None).await,
            Err(DatapathError::NoRoute { .. })
        ));

        let conn = a.connect(&ClientConfig::insecure(addr)).await.unwrap();
        a.set_route(&svc(2), conn).unwrap();
        assert!(a.set_route(&svc(2), conn + 1000).is_err());
        a.disconnect(conn).unwrap();
        assert!(a.fabric().routes().is_empty());
        assert!(a.publish(&msg, None).await.is_err());
    }
}
