//! A node loaded from a config file relays traffic between two peers.

use std::io::Write;
use std::time::Duration;

use slim_datapath::{Message, MessageProcessor, Name};
use slim_node::{Node, NodeConfig};
use slim_transport::ClientConfig;

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_node_from_file_relays_subscriptions() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{"servers": [{{"endpoint": "127.0.0.1:0", "tls": {{"insecure": true}}}}]}}"#
    )
    .unwrap();
    let config = NodeConfig::from_file(file.path()).unwrap();
    let node = Node::start(&config).await.unwrap();
    let endpoint = node.endpoints()[0].clone();

    let (edge, _deliveries) = MessageProcessor::new();
    let conn = edge
        .connect(&ClientConfig::insecure(endpoint))
        .await
        .unwrap();
    let name = Name::new(["org", "ns", "edge"], Some(9)).unwrap();
    let announce = Message::subscribe(name.clone(), name.clone());
    edge.send_to(conn, &announce).await.unwrap();

    wait_until(|| {
        node.processor()
            .fabric()
            .subscriptions()
            .iter()
            .any(|(n, c)| *n == name && c.is_some())
    })
    .await;

    edge.shutdown();
    wait_until(|| {
        !node
            .processor()
            .fabric()
            .subscriptions()
            .iter()
            .any(|(n, _)| *n == name)
    })
    .await;
    node.shutdown();
}
