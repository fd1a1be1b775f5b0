//! Shared fixtures: an in-process router and apps connected to it.

#![allow(dead_code)]

use std::time::Duration;

use slim_datapath::MessageProcessor;
use slim_session::{App, AuthConfig, ClientConfig, ConnectionId, Name, ServerConfig};

pub const SECRET: &str = "integration-secret-0123456789abcdef";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn name(components: [&str; 3], id: u64) -> Name {
    Name::new(components, Some(id)).unwrap()
}

pub fn shared_secret(secret: &str) -> AuthConfig {
    AuthConfig::SharedSecret {
        secret: secret.to_string(),
    }
}

/// A routing node with no local endpoint.
pub struct TestRouter {
    pub processor: MessageProcessor,
    pub endpoint: String,
}

impl TestRouter {
    pub async fn start() -> Self {
        let (processor, _deliveries) = MessageProcessor::new();
        let endpoint = processor
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();
        Self {
            processor,
            endpoint,
        }
    }

    /// Starts an app, connects it and waits until the router learned its name.
    pub async fn app(&self, components: [&str; 3], id: u64) -> (App, ConnectionId) {
        self.app_with_auth(components, id, &shared_secret(SECRET)).await
    }

    pub async fn app_with_auth(
        &self,
        components: [&str; 3],
        id: u64,
        auth: &AuthConfig,
    ) -> (App, ConnectionId) {
        let app = App::new(name(components, id), auth).unwrap();
        let conn = app
            .connect(&ClientConfig::insecure(self.endpoint.clone()))
            .await
            .unwrap();
        self.wait_subscribed(app.name(), true).await;
        (app, conn)
    }

    pub fn knows(&self, name: &Name) -> bool {
        self.processor
            .fabric()
            .subscriptions()
            .iter()
            .any(|(n, conn)| n == name && conn.is_some())
    }

    pub async fn wait_subscribed(&self, name: &Name, present: bool) {
        wait_until(|| self.knows(name) == present).await;
    }
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
