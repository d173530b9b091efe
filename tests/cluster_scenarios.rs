//! Cluster scenarios on the in-memory broker.
//!
//! Each `Connection` stands for one server process; all share one broker.
//!
//! Run with: cargo test --test cluster_scenarios --features test-utils

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cluster_topic_adapter::broker::{
    InMemoryBroker, OutboundMessage, PropertyValue, ReceiveMode,
};
use cluster_topic_adapter::bus::envelope::{NSP_PROPERTY, UID_PROPERTY};
use cluster_topic_adapter::bus::{BusError, Codec, MsgPackCodec, RoutingEnvelope};
use cluster_topic_adapter::cluster::ServerId;
use cluster_topic_adapter::test_utils::{make_message, make_response, RecordingHandler};
use cluster_topic_adapter::{
    AdapterOptions, ClusterTransport, Connection, MessageType, NamespaceAdapter,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(100);

type Adapter = Arc<NamespaceAdapter<RecordingHandler>>;

struct Server {
    connection: Arc<Connection>,
    root: Adapter,
}

async fn start_server(broker: &InMemoryBroker, options: &AdapterOptions) -> Server {
    let connection = Connection::new(broker, Arc::new(broker.clone()), options.clone());
    let root = connection
        .create_adapter("/", RecordingHandler::new())
        .unwrap();
    root.init().await.unwrap();
    Server { connection, root }
}

async fn cluster(broker: &InMemoryBroker, size: usize) -> Vec<Server> {
    let options = AdapterOptions::default();
    let mut servers = Vec::with_capacity(size);
    for _ in 0..size {
        servers.push(start_server(broker, &options).await);
    }
    servers
}

#[tokio::test]
async fn test_broadcast_reaches_every_other_server() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 3).await;
    let (a, b, c) = (&servers[0].root, &servers[1].root, &servers[2].root);

    let message = make_message(
        a.uid(),
        "/",
        MessageType::Broadcast,
        json!({"packet": {"data": ["hello", {"nested": [1, 2.5, true, null]}]}}),
    );
    a.do_publish(&message).await.unwrap();

    assert!(b.handler().wait_for_messages(1, WAIT).await);
    assert!(c.handler().wait_for_messages(1, WAIT).await);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(b.handler().messages(), vec![message.clone()]);
    assert_eq!(c.handler().messages(), vec![message]);
    assert!(a.handler().messages().is_empty());
}

#[tokio::test]
async fn test_response_reaches_only_requester() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 3).await;
    let (a, b, c) = (&servers[0].root, &servers[1].root, &servers[2].root);

    let request = make_message(a.uid(), "/", MessageType::FetchSockets, json!({"opts": {}}));
    a.do_publish(&request).await.unwrap();
    assert!(b.handler().wait_for_messages(1, WAIT).await);

    let response = make_response(MessageType::FetchSocketsResponse, json!({"sockets": []}));
    b.do_publish_response(a.uid(), &response).await.unwrap();

    assert!(a.handler().wait_for_responses(1, WAIT).await);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(a.handler().responses(), vec![response]);
    assert!(b.handler().responses().is_empty());
    assert!(c.handler().responses().is_empty());
    // A response is never delivered as a regular message.
    assert!(a.handler().messages().is_empty());
    assert_eq!(c.handler().messages(), vec![request]);
}

#[tokio::test]
async fn test_message_without_properties_is_dropped() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 2).await;
    let (a, b) = (&servers[0].root, &servers[1].root);

    let stray = OutboundMessage {
        body: Bytes::from_static(b"not for us"),
        ..Default::default()
    };
    broker.deliver("socket.io", stray).unwrap();

    let message = make_message(a.uid(), "/", MessageType::ServerSideEmit, json!(["ping"]));
    a.do_publish(&message).await.unwrap();

    assert!(b.handler().wait_for_messages(1, WAIT).await);
    assert_eq!(b.handler().messages(), vec![message]);
}

#[tokio::test]
async fn test_non_string_namespace_is_dropped() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 1).await;
    let a = &servers[0].root;

    let mut bad = OutboundMessage::default();
    bad.application_properties
        .insert(NSP_PROPERTY.to_string(), PropertyValue::Bool(true));
    bad.application_properties
        .insert(UID_PROPERTY.to_string(), PropertyValue::from("stranger"));
    broker.deliver("socket.io", bad).unwrap();
    tokio::time::sleep(SETTLE).await;

    assert!(a.handler().messages().is_empty());
    // Dropped messages are still settled.
    assert_eq!(
        broker.locked_count("socket.io", servers[0].connection.subscription_name()),
        0
    );
}

#[tokio::test]
async fn test_unknown_namespace_is_dropped() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 2).await;
    let (a, b) = (&servers[0].root, &servers[1].root);

    let orphan = make_message(a.uid(), "/orphan", MessageType::Broadcast, json!({}));
    let body = MsgPackCodec.encode(&orphan).unwrap();
    broker
        .deliver(
            "socket.io",
            OutboundMessage {
                body: Bytes::from(body),
                application_properties: RoutingEnvelope::broadcast("/orphan", a.uid().clone())
                    .to_properties(),
            },
        )
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    assert!(b.handler().messages().is_empty());
    assert_eq!(broker.stats().messages_completed, 2);
}

#[tokio::test]
async fn test_namespaces_share_one_subscription_per_server() {
    let broker = InMemoryBroker::new();
    let options = AdapterOptions::default();
    let server_a = start_server(&broker, &options).await;
    let server_b = start_server(&broker, &options).await;

    let admin_a = server_a
        .connection
        .create_adapter("/admin", RecordingHandler::new())
        .unwrap();
    let admin_b = server_b
        .connection
        .create_adapter("/admin", RecordingHandler::new())
        .unwrap();
    admin_a.init().await.unwrap();
    admin_b.init().await.unwrap();

    assert_eq!(broker.subscription_names("socket.io").len(), 2);
    assert_eq!(broker.stats().subscriptions_created, 2);

    let message = make_message(admin_a.uid(), "/admin", MessageType::Broadcast, json!({}));
    admin_a.do_publish(&message).await.unwrap();

    assert!(admin_b.handler().wait_for_messages(1, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    assert!(server_b.root.handler().messages().is_empty());
}

#[tokio::test]
async fn test_peek_lock_settles_every_delivery() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 2).await;
    let (a, b) = (&servers[0].root, &servers[1].root);

    for i in 0..5 {
        let message = make_message(a.uid(), "/", MessageType::Broadcast, json!({ "i": i }));
        a.do_publish(&message).await.unwrap();
    }
    assert!(b.handler().wait_for_messages(5, WAIT).await);
    tokio::time::sleep(SETTLE).await;

    // Five deliveries to each of the two subscriptions.
    assert_eq!(broker.stats().messages_completed, 10);
    for server in &servers {
        assert_eq!(
            broker.locked_count("socket.io", server.connection.subscription_name()),
            0
        );
    }
}

#[tokio::test]
async fn test_receive_and_delete_cluster() {
    let broker = InMemoryBroker::new();
    let options = AdapterOptions::default().with_receive_mode(ReceiveMode::ReceiveAndDelete);
    let a = start_server(&broker, &options).await;
    let b = start_server(&broker, &options).await;

    let message = make_message(a.root.uid(), "/", MessageType::Broadcast, json!({}));
    a.root.do_publish(&message).await.unwrap();

    assert!(b.root.handler().wait_for_messages(1, WAIT).await);
    assert_eq!(broker.stats().messages_completed, 0);
}

#[tokio::test]
async fn test_server_shutdown_leaves_others_running() {
    let broker = InMemoryBroker::new();
    let servers = cluster(&broker, 3).await;

    servers[2].root.close().await;
    assert!(servers[2].connection.is_closed());
    assert!(!broker.subscription_exists("socket.io", servers[2].connection.subscription_name()));
    assert_eq!(broker.subscription_names("socket.io").len(), 2);

    let message = make_message(servers[0].root.uid(), "/", MessageType::Broadcast, json!({}));
    servers[0].root.do_publish(&message).await.unwrap();
    assert!(servers[1].root.handler().wait_for_messages(1, WAIT).await);
    assert!(servers[2].root.handler().messages().is_empty());

    let err = servers[2].root.do_publish(&message).await.unwrap_err();
    assert_eq!(err, BusError::AdapterClosed("/".to_string()));
}

#[tokio::test]
async fn test_pre_existing_topic_is_reused() {
    let broker = InMemoryBroker::new();
    broker.precreate_topic("socket.io");

    let servers = cluster(&broker, 2).await;

    assert_eq!(broker.stats().topics_created, 0);
    assert_eq!(broker.stats().subscriptions_created, 2);
    for server in &servers {
        assert!(server.connection.subscription_name().starts_with("socket.io-"));
    }
}

#[tokio::test]
async fn test_late_server_receives_only_new_messages() {
    let broker = InMemoryBroker::new();
    let mut servers = cluster(&broker, 1).await;

    let early = make_message(&ServerId::from("ghost"), "/", MessageType::Broadcast, json!(1));
    servers[0].root.do_publish(&early).await.unwrap();

    servers.push(start_server(&broker, &AdapterOptions::default()).await);
    let late = make_message(servers[0].root.uid(), "/", MessageType::Broadcast, json!(2));
    servers[0].root.do_publish(&late).await.unwrap();

    assert!(servers[1].root.handler().wait_for_messages(1, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    assert_eq!(servers[1].root.handler().messages(), vec![late]);
}
