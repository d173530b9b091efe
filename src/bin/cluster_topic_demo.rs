//! cluster-topic-demo: two simulated servers on one in-memory broker
//!
//! Opens two connections to the same topic, registers the root namespace on
//! each, broadcasts from the first and logs what the second receives.
//!
//! ## Configuration
//! - CLUSTER_TOPIC_LOG: tracing filter (default: info)
//! - CLUSTER_TOPIC_CONFIG: YAML file with adapter options (optional)
//! - CLUSTER_TOPIC__TOPIC_NAME etc.: per-field overrides

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tracing::info;

use cluster_topic_adapter::broker::InMemoryBroker;
use cluster_topic_adapter::utils::bootstrap::init_tracing;
use cluster_topic_adapter::{
    AdapterOptions, ClusterHandler, ClusterMessage, ClusterResponse, ClusterTransport, Connection,
    MessageType,
};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler that logs every cluster message it receives.
struct LoggingHandler {
    server: &'static str,
    received: Arc<Notify>,
}

#[async_trait]
impl ClusterHandler for LoggingHandler {
    async fn on_message(&self, message: ClusterMessage) {
        info!(
            server = self.server,
            from = %message.uid,
            nsp = %message.nsp,
            kind = ?message.kind,
            data = ?message.data,
            "Cluster message received"
        );
        self.received.notify_one();
    }

    async fn on_response(&self, response: ClusterResponse) {
        info!(server = self.server, kind = ?response.kind, "Cluster response received");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let options = AdapterOptions::load(None)?;
    let broker = InMemoryBroker::new();
    let received = Arc::new(Notify::new());

    let server_a = Connection::new(&broker, Arc::new(broker.clone()), options.clone());
    let server_b = Connection::new(&broker, Arc::new(broker.clone()), options);

    let adapter_a = server_a.create_adapter(
        "/",
        LoggingHandler {
            server: "a",
            received: received.clone(),
        },
    )?;
    let adapter_b = server_b.create_adapter(
        "/",
        LoggingHandler {
            server: "b",
            received: received.clone(),
        },
    )?;

    adapter_a.init().await?;
    adapter_b.init().await?;
    info!(
        topic = %server_a.topic_name(),
        subscription_a = %server_a.subscription_name(),
        subscription_b = %server_b.subscription_name(),
        "cluster-topic-demo started"
    );

    let message = ClusterMessage {
        uid: adapter_a.uid().clone(),
        nsp: "/".to_string(),
        kind: MessageType::Broadcast,
        data: Some(json!({ "packet": { "data": ["hello", { "from": "a" }] } })),
    };
    let offset = adapter_a.do_publish(&message).await?;
    info!(offset = ?offset, "Broadcast published");

    if tokio::time::timeout(RECEIVE_TIMEOUT, received.notified())
        .await
        .is_err()
    {
        tracing::warn!("No cluster message received before timeout");
    }

    adapter_a.close().await;
    adapter_b.close().await;

    let stats = broker.stats();
    info!(
        messages_sent = stats.messages_sent,
        subscriptions_deleted = stats.subscriptions_deleted,
        "cluster-topic-demo finished"
    );
    Ok(())
}
