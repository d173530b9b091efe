use super::*;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

struct ForwardingHandler {
    messages: UnboundedSender<ReceivedMessage>,
    errors: UnboundedSender<BrokerError>,
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn process_message(&self, message: ReceivedMessage) {
        let _ = self.messages.send(message);
    }

    async fn process_error(&self, error: BrokerError) {
        let _ = self.errors.send(error);
    }
}

fn forwarding_handler() -> (
    Arc<ForwardingHandler>,
    mpsc::UnboundedReceiver<ReceivedMessage>,
    mpsc::UnboundedReceiver<BrokerError>,
) {
    let (messages, messages_rx) = mpsc::unbounded_channel();
    let (errors, errors_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ForwardingHandler { messages, errors }),
        messages_rx,
        errors_rx,
    )
}

async fn setup(broker: &InMemoryBroker, subscriptions: &[&str]) {
    broker
        .create_topic("cluster", &TopicOptions::default())
        .await
        .unwrap();
    for name in subscriptions {
        broker
            .create_subscription("cluster", name, &SubscriptionOptions::default())
            .await
            .unwrap();
    }
}

fn text_message(body: &'static str) -> OutboundMessage {
    let mut message = OutboundMessage {
        body: Bytes::from_static(body.as_bytes()),
        ..Default::default()
    };
    message
        .application_properties
        .insert("nsp".to_string(), "/".into());
    message
}

#[tokio::test]
async fn test_get_topic_not_found() {
    let broker = InMemoryBroker::new();
    let err = broker.get_topic("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_create_topic_twice_already_exists() {
    let broker = InMemoryBroker::new();
    setup(&broker, &[]).await;

    let err = broker
        .create_topic("cluster", &TopicOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(broker.stats().topics_created, 1);
}

#[tokio::test]
async fn test_create_subscription_requires_topic() {
    let broker = InMemoryBroker::new();
    let err = broker
        .create_subscription("cluster", "sub", &SubscriptionOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_send_fans_out_to_every_subscription() {
    let broker = InMemoryBroker::new();
    setup(&broker, &["a", "b"]).await;

    let receiver_a = broker.create_receiver("cluster", "a", &ReceiverOptions::default());
    let receiver_b = broker.create_receiver("cluster", "b", &ReceiverOptions::default());
    let (handler_a, mut rx_a, _) = forwarding_handler();
    let (handler_b, mut rx_b, _) = forwarding_handler();
    receiver_a.subscribe(handler_a).await.unwrap();
    receiver_b.subscribe(handler_b).await.unwrap();

    let sender = broker.create_sender("cluster");
    let receipt = sender.send(text_message("hello")).await.unwrap();
    assert!(receipt.message_id.is_some());

    let a = rx_a.recv().await.unwrap();
    let b = rx_b.recv().await.unwrap();
    assert_eq!(a.body, Bytes::from_static(b"hello"));
    assert_eq!(b.body, Bytes::from_static(b"hello"));
    assert_eq!(
        a.application_properties.unwrap()["nsp"].as_str(),
        Some("/")
    );
}

#[tokio::test]
async fn test_message_without_properties_has_none() {
    let broker = InMemoryBroker::new();
    setup(&broker, &["a"]).await;

    let receiver = broker.create_receiver("cluster", "a", &ReceiverOptions::default());
    let (handler, mut rx, _) = forwarding_handler();
    receiver.subscribe(handler).await.unwrap();

    broker.deliver("cluster", OutboundMessage::default()).unwrap();

    let message = rx.recv().await.unwrap();
    assert!(message.application_properties.is_none());
}

#[tokio::test]
async fn test_peek_lock_requires_completion() {
    let broker = InMemoryBroker::new();
    setup(&broker, &["a"]).await;

    let receiver = broker.create_receiver("cluster", "a", &ReceiverOptions::default());
    let (handler, mut rx, _) = forwarding_handler();
    receiver.subscribe(handler).await.unwrap();

    broker.deliver("cluster", text_message("one")).unwrap();
    let message = rx.recv().await.unwrap();
    assert!(message.lock_token.is_some());
    assert_eq!(broker.locked_count("cluster", "a"), 1);

    receiver.complete_message(&message).await.unwrap();
    assert_eq!(broker.locked_count("cluster", "a"), 0);
    assert_eq!(broker.stats().messages_completed, 1);

    // Settling twice fails.
    assert!(receiver.complete_message(&message).await.is_err());
}

#[tokio::test]
async fn test_receive_and_delete_has_no_lock() {
    let broker = InMemoryBroker::new();
    setup(&broker, &["a"]).await;

    let options = ReceiverOptions {
        receive_mode: ReceiveMode::ReceiveAndDelete,
        ..Default::default()
    };
    let receiver = broker.create_receiver("cluster", "a", &options);
    let (handler, mut rx, _) = forwarding_handler();
    receiver.subscribe(handler).await.unwrap();

    broker.deliver("cluster", text_message("one")).unwrap();
    let message = rx.recv().await.unwrap();
    assert!(message.lock_token.is_none());
    assert_eq!(broker.locked_count("cluster", "a"), 0);
    assert!(receiver.complete_message(&message).await.is_err());
}

#[tokio::test]
async fn test_subscribe_to_missing_subscription_fails() {
    let broker = InMemoryBroker::new();
    setup(&broker, &[]).await;

    let receiver = broker.create_receiver("cluster", "ghost", &ReceiverOptions::default());
    let (handler, _, _) = forwarding_handler();
    let err = receiver.subscribe(handler).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_deleting_subscription_reports_error_to_receiver() {
    let broker = InMemoryBroker::new();
    setup(&broker, &["a"]).await;

    let receiver = broker.create_receiver("cluster", "a", &ReceiverOptions::default());
    let (handler, _, mut errors) = forwarding_handler();
    receiver.subscribe(handler).await.unwrap();

    broker.delete_subscription("cluster", "a").await.unwrap();

    let error = errors.recv().await.unwrap();
    assert!(error.is_not_found());
    assert!(!broker.subscription_exists("cluster", "a"));
    assert_eq!(broker.stats().subscriptions_deleted, 1);
}

#[tokio::test]
async fn test_closed_sender_rejects_sends() {
    let broker = InMemoryBroker::new();
    setup(&broker, &[]).await;

    let sender = broker.create_sender("cluster");
    sender.close().await.unwrap();
    sender.close().await.unwrap();

    let err = sender.send(text_message("late")).await.unwrap_err();
    assert_eq!(err, BrokerError::Closed);
    assert_eq!(broker.stats().senders_closed, 1);
}

#[tokio::test]
async fn test_send_failure_injection() {
    let broker = InMemoryBroker::new();
    setup(&broker, &[]).await;
    broker.set_fail_on_send(true);

    let sender = broker.create_sender("cluster");
    let err = sender.send(text_message("x")).await.unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));
    assert_eq!(broker.stats().messages_sent, 0);
}

#[tokio::test]
async fn test_closed_receiver_stops_delivering() {
    let broker = InMemoryBroker::new();
    setup(&broker, &["a"]).await;

    let receiver = broker.create_receiver("cluster", "a", &ReceiverOptions::default());
    let (handler, mut rx, _) = forwarding_handler();
    receiver.subscribe(handler).await.unwrap();
    receiver.close().await.unwrap();

    broker.deliver("cluster", text_message("after close")).unwrap();

    // The loop was aborted, so its handler (and sender half) is dropped.
    assert!(rx.recv().await.is_none());
    assert_eq!(broker.stats().receivers_closed, 1);
}
