//! Shared fixtures for the bindings scenarios.

#![allow(dead_code)]

use std::time::Duration;

use slim_bindings::{block_on, create_app_with_secret, BindingsAdapter};
use slim_datapath::MessageProcessor;
use slim_session::{ClientConfig, ConnectionId, Name, ServerConfig, SlimError};

pub const SECRET: &str = "bindings-secret-0123456789abcdefgh";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn name(id: u64) -> Name {
    Name::new(["org", "ns", "svc"], Some(id)).unwrap()
}

/// Routing node running on the bindings runtime.
pub struct Router {
    pub processor: MessageProcessor,
    pub endpoint: String,
}

impl Router {
    pub fn start() -> Self {
        let (processor, endpoint) = block_on(async {
            let (processor, _deliveries) = MessageProcessor::new();
            let endpoint = processor
                .run_server(&ServerConfig::insecure("127.0.0.1:0"))
                .await
                .map_err(SlimError::service)?;
            Ok((processor, endpoint))
        })
        .unwrap();
        Self {
            processor,
            endpoint,
        }
    }

    /// Creates an adapter, connects it and waits until the router knows it.
    pub fn adapter(&self, id: u64) -> (BindingsAdapter, ConnectionId) {
        let adapter = create_app_with_secret(name(id), SECRET.to_string()).unwrap();
        let conn = adapter
            .connect(ClientConfig::insecure(self.endpoint.clone()))
            .unwrap();
        let expected = adapter.name();
        wait_until(|| {
            self.processor
                .fabric()
                .subscriptions()
                .iter()
                .any(|(n, c)| *n == expected && c.is_some())
        });
        (adapter, conn)
    }
}

pub fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached");
}
