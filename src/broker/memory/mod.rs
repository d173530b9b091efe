//! In-memory broker for standalone mode.
//!
//! Every subscription owns an unbounded tokio channel; sending to a topic fans
//! the message out to all of its subscriptions. Ideal for local development and
//! testing without an external broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    AdminClient, BrokerClient, BrokerError, MessageHandler, OutboundMessage, ReceiveMode,
    ReceivedMessage, Result, SendReceipt, SubscriptionReceiver, TopicProperties, TopicSender,
};
use crate::config::{ReceiverOptions, SubscriptionOptions, TopicOptions};

/// Counters of broker-side operations, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub topics_created: usize,
    pub subscriptions_created: usize,
    pub subscriptions_deleted: usize,
    pub messages_sent: usize,
    pub messages_completed: usize,
    pub senders_closed: usize,
    pub receivers_closed: usize,
}

#[derive(Default)]
struct Counters {
    topics_created: AtomicUsize,
    subscriptions_created: AtomicUsize,
    subscriptions_deleted: AtomicUsize,
    messages_sent: AtomicUsize,
    messages_completed: AtomicUsize,
    senders_closed: AtomicUsize,
    receivers_closed: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    report_topic_missing: AtomicBool,
    fail_on_create_topic: AtomicBool,
    fail_on_create_subscription: AtomicBool,
    fail_on_delete_subscription: AtomicBool,
    fail_on_send: AtomicBool,
}

struct SubscriptionQueue {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
    /// Taken by the first receiver that subscribes.
    rx: Option<mpsc::UnboundedReceiver<ReceivedMessage>>,
    /// Lock tokens of delivered, not yet completed, peek-lock messages.
    locked: HashSet<String>,
}

#[derive(Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionQueue>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
    next_message_id: AtomicU64,
    counters: Counters,
    faults: Faults,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicState>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-local broker implementing both the admin and data-plane clients.
///
/// Cloning yields another handle to the same broker, so several connections
/// (standing in for separate server processes) can share one topic.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            topics_created: c.topics_created.load(Ordering::SeqCst),
            subscriptions_created: c.subscriptions_created.load(Ordering::SeqCst),
            subscriptions_deleted: c.subscriptions_deleted.load(Ordering::SeqCst),
            messages_sent: c.messages_sent.load(Ordering::SeqCst),
            messages_completed: c.messages_completed.load(Ordering::SeqCst),
            senders_closed: c.senders_closed.load(Ordering::SeqCst),
            receivers_closed: c.receivers_closed.load(Ordering::SeqCst),
        }
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.inner.topics().contains_key(topic)
    }

    pub fn subscription_exists(&self, topic: &str, subscription: &str) -> bool {
        self.inner
            .topics()
            .get(topic)
            .is_some_and(|t| t.subscriptions.contains_key(subscription))
    }

    pub fn subscription_names(&self, topic: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .topics()
            .get(topic)
            .map(|t| t.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Peek-locked messages delivered on a subscription and not yet completed.
    pub fn locked_count(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .topics()
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map_or(0, |s| s.locked.len())
    }

    /// Create a topic without counting it as a client-side creation.
    pub fn precreate_topic(&self, topic: &str) {
        self.inner.topics().entry(topic.to_string()).or_default();
    }

    /// Make `get_topic` report every topic as missing.
    pub fn set_report_topic_missing(&self, value: bool) {
        self.inner.faults.report_topic_missing.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_on_create_topic(&self, fail: bool) {
        self.inner.faults.fail_on_create_topic.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_create_subscription(&self, fail: bool) {
        self.inner
            .faults
            .fail_on_create_subscription
            .store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_delete_subscription(&self, fail: bool) {
        self.inner
            .faults
            .fail_on_delete_subscription
            .store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.inner.faults.fail_on_send.store(fail, Ordering::SeqCst);
    }

    fn lock_message(&self, topic: &str, subscription: &str, token: &str) {
        if let Some(queue) = self
            .inner
            .topics()
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
        {
            queue.locked.insert(token.to_string());
        }
    }

    /// Deliver a message to every subscription of `topic`.
    ///
    /// Used by senders; exposed so tests can inject arbitrary (including
    /// malformed) messages.
    pub fn deliver(&self, topic: &str, message: OutboundMessage) -> Result<SendReceipt> {
        let id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = format!("mem-{}", id);

        let topics = self.inner.topics();
        let state = topics
            .get(topic)
            .ok_or_else(|| BrokerError::NotFound(format!("topic {}", topic)))?;

        let received = ReceivedMessage {
            message_id: message_id.clone(),
            body: message.body,
            application_properties: if message.application_properties.is_empty() {
                None
            } else {
                Some(message.application_properties)
            },
            lock_token: None,
        };

        for queue in state.subscriptions.values() {
            // A closed channel means the receiver went away; the message is lost for it.
            let _ = queue.tx.send(received.clone());
        }

        self.inner.counters.messages_sent.fetch_add(1, Ordering::SeqCst);
        debug!(
            topic = %topic,
            message_id = %message_id,
            subscriptions = state.subscriptions.len(),
            "Delivered message"
        );

        Ok(SendReceipt {
            message_id: Some(message_id),
        })
    }
}

#[async_trait]
impl AdminClient for InMemoryBroker {
    async fn get_topic(&self, name: &str) -> Result<TopicProperties> {
        if self.inner.faults.report_topic_missing.load(Ordering::SeqCst)
            || !self.topic_exists(name)
        {
            return Err(BrokerError::NotFound(format!("topic {}", name)));
        }
        Ok(TopicProperties {
            name: name.to_string(),
        })
    }

    async fn create_topic(&self, name: &str, _options: &TopicOptions) -> Result<TopicProperties> {
        if self.inner.faults.fail_on_create_topic.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("Mock topic creation failure".to_string()));
        }

        let mut topics = self.inner.topics();
        if topics.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("topic {}", name)));
        }
        topics.insert(name.to_string(), TopicState::default());
        self.inner.counters.topics_created.fetch_add(1, Ordering::SeqCst);

        info!(topic = %name, "Created in-memory topic");
        Ok(TopicProperties {
            name: name.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        _options: &SubscriptionOptions,
    ) -> Result<()> {
        if self
            .inner
            .faults
            .fail_on_create_subscription
            .load(Ordering::SeqCst)
        {
            return Err(BrokerError::Transport(
                "Mock subscription creation failure".to_string(),
            ));
        }

        let mut topics = self.inner.topics();
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::NotFound(format!("topic {}", topic)))?;
        if state.subscriptions.contains_key(subscription) {
            return Err(BrokerError::AlreadyExists(format!(
                "subscription {}",
                subscription
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionQueue {
                tx,
                rx: Some(rx),
                locked: HashSet::new(),
            },
        );
        self.inner
            .counters
            .subscriptions_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<()> {
        if self
            .inner
            .faults
            .fail_on_delete_subscription
            .load(Ordering::SeqCst)
        {
            return Err(BrokerError::Transport(
                "Mock subscription deletion failure".to_string(),
            ));
        }

        let mut topics = self.inner.topics();
        topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.remove(subscription))
            .ok_or_else(|| BrokerError::NotFound(format!("subscription {}", subscription)))?;
        self.inner
            .counters
            .subscriptions_deleted
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl BrokerClient for InMemoryBroker {
    fn create_sender(&self, topic: &str) -> Arc<dyn TopicSender> {
        Arc::new(MemorySender {
            broker: self.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn create_receiver(
        &self,
        topic: &str,
        subscription: &str,
        options: &ReceiverOptions,
    ) -> Arc<dyn SubscriptionReceiver> {
        Arc::new(MemoryReceiver {
            broker: self.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            mode: options.receive_mode,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

struct MemorySender {
    broker: InMemoryBroker,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl TopicSender for MemorySender {
    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.broker.inner.faults.fail_on_send.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("Mock send failure".to_string()));
        }
        self.broker.deliver(&self.topic, message)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker
                .inner
                .counters
                .senders_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryReceiver {
    broker: InMemoryBroker,
    topic: String,
    subscription: String,
    mode: ReceiveMode,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl SubscriptionReceiver for MemoryReceiver {
    fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut rx = {
            let mut topics = self.broker.inner.topics();
            let queue = topics
                .get_mut(&self.topic)
                .and_then(|t| t.subscriptions.get_mut(&self.subscription))
                .ok_or_else(|| {
                    BrokerError::NotFound(format!("subscription {}", self.subscription))
                })?;
            queue.rx.take().ok_or_else(|| {
                BrokerError::Transport(format!(
                    "subscription {} already has a receiver",
                    self.subscription
                ))
            })?
        };

        let broker = self.broker.clone();
        let topic = self.topic.clone();
        let subscription = self.subscription.clone();
        let mode = self.mode;

        let task = tokio::spawn(async move {
            while let Some(mut message) = rx.recv().await {
                if mode == ReceiveMode::PeekLock {
                    let token = message.message_id.clone();
                    broker.lock_message(&topic, &subscription, &token);
                    message.lock_token = Some(token);
                }
                handler.process_message(message).await;
            }
            handler
                .process_error(BrokerError::NotFound(format!(
                    "subscription {} was removed",
                    subscription
                )))
                .await;
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        debug!(subscription = %self.subscription, "In-memory receiver started");
        Ok(())
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<()> {
        if self.mode != ReceiveMode::PeekLock {
            return Err(BrokerError::Transport(
                "messages received in receiveAndDelete mode cannot be settled".to_string(),
            ));
        }
        let token = message
            .lock_token
            .as_deref()
            .ok_or_else(|| BrokerError::NotFound("lock token".to_string()))?;

        let mut topics = self.broker.inner.topics();
        let removed = topics
            .get_mut(&self.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.subscription))
            .is_some_and(|queue| queue.locked.remove(token));
        if !removed {
            return Err(BrokerError::NotFound(format!("lock {}", token)));
        }
        self.broker
            .inner
            .counters
            .messages_completed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.broker
            .inner
            .counters
            .receivers_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
