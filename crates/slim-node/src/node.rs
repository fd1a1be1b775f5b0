//! Node lifecycle: start listeners, dial peers, drain, shut down.

use anyhow::{Context, Result};
use slim_datapath::{DatapathMetricsSnapshot, MessageProcessor};
use slim_transport::{ConnectionId, MetricsSnapshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NodeConfig;

/// A running routing node.
pub struct Node {
    processor: MessageProcessor,
    endpoints: Vec<String>,
    connections: Vec<ConnectionId>,
    drain_task: JoinHandle<()>,
}

impl Node {
    /// Starts every configured server, then dials every configured client.
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        let (processor, mut deliveries) = MessageProcessor::new();
        // No local subscriptions; drain stray deliveries.
        let drain_task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                debug!(source = %delivery.message.source, "dropping local delivery");
            }
        });

        let mut endpoints = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let local = processor
                .run_server(server)
                .await
                .with_context(|| format!("starting server on {}", server.endpoint))?;
            info!(endpoint = %server.endpoint, local_addr = %local, "listening");
            endpoints.push(local);
        }

        let mut connections = Vec::with_capacity(config.clients.len());
        for client in &config.clients {
            let conn_id = processor
                .connect(client)
                .await
                .with_context(|| format!("connecting to {}", client.endpoint))?;
            info!(endpoint = %client.endpoint, conn_id, "link established");
            connections.push(conn_id);
        }

        Ok(Self {
            processor,
            endpoints,
            connections,
            drain_task,
        })
    }

    /// Bound addresses of the running servers.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Outbound connections opened from the configured clients.
    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    /// The underlying message processor.
    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    /// Counters of the transport surface.
    pub fn transport_metrics(&self) -> MetricsSnapshot {
        self.processor.surface().metrics()
    }

    /// Processor counters, transport counters included.
    pub fn datapath_metrics(&self) -> DatapathMetricsSnapshot {
        self.processor.metrics()
    }

    /// Closes every connection and stops every server.
    pub fn shutdown(self) {
        self.processor.shutdown();
        self.drain_task.abort();
        info!("node stopped");
    }
}
