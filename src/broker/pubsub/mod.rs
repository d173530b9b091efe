//! Google Pub/Sub broker.
//!
//! Maps the topic/subscription model onto Pub/Sub directly. Application
//! properties travel as message attributes; non-string properties are
//! rendered as strings, so receivers only ever see `PropertyValue::String`.
//!
//! # Authentication
//!
//! Uses ADC (Application Default Credentials):
//! - Set `GOOGLE_APPLICATION_CREDENTIALS` to a service account JSON path
//! - For local testing: set `PUBSUB_EMULATOR_HOST` to the emulator address

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscriber::ReceivedMessage as PubSubMessage;
use google_cloud_pubsub::subscription::{Subscription, SubscriptionConfig};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    AdminClient, ApplicationProperties, BrokerClient, BrokerError, MessageHandler,
    OutboundMessage, PropertyValue, ReceiveMode, ReceivedMessage, Result, SendReceipt,
    SubscriptionReceiver, TopicProperties, TopicSender,
};
use crate::config::{ReceiverOptions, SubscriptionOptions, TopicOptions};
use crate::utils::retry::pull_backoff;

/// Pub/Sub accepts ack deadlines between these bounds (seconds).
const MIN_ACK_DEADLINE_SECS: u64 = 10;
const MAX_ACK_DEADLINE_SECS: u64 = 600;

/// Configuration for the Pub/Sub broker.
#[derive(Clone, Debug)]
pub struct PubSubBrokerConfig {
    /// Messages requested per pull when the receiver sets no prefetch count.
    pub pull_batch_size: i32,
    /// Upper bound of the pull retry backoff.
    pub max_pull_backoff: Duration,
}

impl Default for PubSubBrokerConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: 10,
            max_pull_backoff: Duration::from_secs(30),
        }
    }
}

/// Broker client backed by Google Pub/Sub.
#[derive(Clone)]
pub struct PubSubBroker {
    client: Client,
    config: PubSubBrokerConfig,
}

impl PubSubBroker {
    /// Connect using Application Default Credentials.
    pub async fn connect(config: PubSubBrokerConfig) -> Result<Self> {
        let client_config = ClientConfig::default().with_auth().await.map_err(|e| {
            BrokerError::Transport(format!("Failed to configure Pub/Sub auth: {}", e))
        })?;

        let client = Client::new(client_config).await.map_err(|e| {
            BrokerError::Transport(format!("Failed to create Pub/Sub client: {}", e))
        })?;

        info!("Connected to Google Pub/Sub");
        Ok(Self { client, config })
    }

    fn subscription_config(options: &SubscriptionOptions) -> SubscriptionConfig {
        let mut config = SubscriptionConfig::default();
        if let Some(secs) = options.lock_duration_secs {
            config.ack_deadline_seconds =
                secs.clamp(MIN_ACK_DEADLINE_SECS, MAX_ACK_DEADLINE_SECS) as i32;
        }
        if options.max_delivery_count.is_some() {
            debug!("max_delivery_count requires a dead-letter topic; ignored");
        }
        if let Some(secs) = options.auto_delete_on_idle_secs {
            debug!(
                idle_secs = secs,
                "auto_delete_on_idle_secs unsupported; default expiration applies"
            );
        }
        config
    }
}

#[async_trait]
impl AdminClient for PubSubBroker {
    async fn get_topic(&self, name: &str) -> Result<TopicProperties> {
        let exists = self
            .client
            .topic(name)
            .exists(None)
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to check topic {}: {}", name, e)))?;
        if !exists {
            return Err(BrokerError::NotFound(format!("topic {}", name)));
        }
        Ok(TopicProperties {
            name: name.to_string(),
        })
    }

    async fn create_topic(&self, name: &str, options: &TopicOptions) -> Result<TopicProperties> {
        if options.max_size_in_megabytes.is_some() || options.default_message_ttl_secs.is_some() {
            debug!(topic = %name, "Topic size and TTL options are not supported by Pub/Sub");
        }

        let topic = self.client.topic(name);
        if let Err(e) = topic.create(None, None).await {
            // Another server may have created it concurrently.
            return match topic.exists(None).await {
                Ok(true) => Err(BrokerError::AlreadyExists(format!("topic {}", name))),
                _ => Err(BrokerError::Transport(format!(
                    "Failed to create topic {}: {}",
                    name, e
                ))),
            };
        }

        info!(topic = %name, "Created Pub/Sub topic");
        Ok(TopicProperties {
            name: name.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<()> {
        let fully_qualified_topic = self.client.topic(topic).fully_qualified_name().to_string();
        self.client
            .subscription(subscription)
            .create(
                &fully_qualified_topic,
                Self::subscription_config(options),
                None,
            )
            .await
            .map_err(|e| {
                BrokerError::Transport(format!(
                    "Failed to create subscription {}: {}",
                    subscription, e
                ))
            })?;

        info!(subscription = %subscription, topic = %topic, "Created Pub/Sub subscription");
        Ok(())
    }

    async fn delete_subscription(&self, _topic: &str, subscription: &str) -> Result<()> {
        self.client
            .subscription(subscription)
            .delete(None)
            .await
            .map_err(|e| {
                BrokerError::Transport(format!(
                    "Failed to delete subscription {}: {}",
                    subscription, e
                ))
            })?;
        info!(subscription = %subscription, "Deleted Pub/Sub subscription");
        Ok(())
    }
}

impl BrokerClient for PubSubBroker {
    fn create_sender(&self, topic: &str) -> Arc<dyn TopicSender> {
        Arc::new(PubSubSender {
            client: self.client.clone(),
            topic: topic.to_string(),
            publisher: tokio::sync::Mutex::new(SenderState::Idle),
        })
    }

    fn create_receiver(
        &self,
        _topic: &str,
        subscription: &str,
        options: &ReceiverOptions,
    ) -> Arc<dyn SubscriptionReceiver> {
        let batch_size = match options.prefetch_count {
            0 => self.config.pull_batch_size,
            n => i32::try_from(n).unwrap_or(i32::MAX),
        };
        Arc::new(PubSubReceiver {
            subscription: self.client.subscription(subscription),
            mode: options.receive_mode,
            batch_size,
            max_backoff: self.config.max_pull_backoff,
            pending: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        })
    }
}

/// Convert application properties to Pub/Sub attributes.
fn to_attributes(properties: ApplicationProperties) -> HashMap<String, String> {
    properties
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                PropertyValue::String(s) => s,
                PropertyValue::Int(i) => i.to_string(),
                PropertyValue::Float(f) => f.to_string(),
                PropertyValue::Bool(b) => b.to_string(),
            };
            (key, value)
        })
        .collect()
}

/// Convert Pub/Sub attributes to application properties.
///
/// An empty attribute map means the publisher attached no properties.
fn from_attributes(attributes: &HashMap<String, String>) -> Option<ApplicationProperties> {
    if attributes.is_empty() {
        return None;
    }
    Some(
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::String(v.clone())))
            .collect(),
    )
}

enum SenderState {
    Idle,
    Open(Publisher),
    Closed,
}

/// Sender with a lazily created publisher.
///
/// The publisher is created on first send so that construction stays free of
/// I/O even though the topic may not exist yet.
struct PubSubSender {
    client: Client,
    topic: String,
    publisher: tokio::sync::Mutex<SenderState>,
}

#[async_trait]
impl TopicSender for PubSubSender {
    #[tracing::instrument(name = "broker.send", skip_all, fields(topic = %self.topic))]
    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt> {
        let publisher = {
            let mut state = self.publisher.lock().await;
            match &*state {
                SenderState::Closed => return Err(BrokerError::Closed),
                SenderState::Open(publisher) => publisher.clone(),
                SenderState::Idle => {
                    let publisher = self.client.topic(&self.topic).new_publisher(None);
                    *state = SenderState::Open(publisher.clone());
                    publisher
                }
            }
        };

        let message = PubsubMessage {
            data: message.body.to_vec(),
            attributes: to_attributes(message.application_properties),
            ..Default::default()
        };

        let message_id = publisher
            .publish(message)
            .await
            .get()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to publish to Pub/Sub: {}", e)))?;

        debug!(message_id = %message_id, "Published message to Pub/Sub");
        Ok(SendReceipt {
            message_id: Some(message_id),
        })
    }

    async fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self.publisher.lock().await;
            std::mem::replace(&mut *state, SenderState::Closed)
        };
        if let SenderState::Open(mut publisher) = previous {
            publisher.shutdown().await;
            debug!(topic = %self.topic, "Pub/Sub publisher shut down");
        }
        Ok(())
    }
}

type PendingAcks = Arc<Mutex<HashMap<String, PubSubMessage>>>;

/// Receiver driving a pull loop on one subscription.
struct PubSubReceiver {
    subscription: Subscription,
    mode: ReceiveMode,
    batch_size: i32,
    max_backoff: Duration,
    /// Peek-locked messages awaiting completion, by ack id.
    pending: PendingAcks,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubReceiver {
    async fn pull_loop(
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
        mode: ReceiveMode,
        batch_size: i32,
        max_backoff: Duration,
        pending: PendingAcks,
    ) {
        info!(subscription = %subscription.id(), "Starting Pub/Sub pull loop");

        let backoff_builder = pull_backoff(max_backoff);
        let mut backoff_iter = backoff_builder.build();

        loop {
            match subscription.pull(batch_size, None).await {
                Ok(messages) => {
                    backoff_iter = backoff_builder.build();

                    for message in messages {
                        let mut received = ReceivedMessage {
                            message_id: message.message.message_id.clone(),
                            body: message.message.data.clone().into(),
                            application_properties: from_attributes(&message.message.attributes),
                            lock_token: None,
                        };

                        match mode {
                            ReceiveMode::ReceiveAndDelete => {
                                if let Err(e) = message.ack().await {
                                    warn!(error = %e, "Failed to ack Pub/Sub message");
                                }
                            }
                            ReceiveMode::PeekLock => {
                                let ack_id = message.ack_id().to_string();
                                received.lock_token = Some(ack_id.clone());
                                pending
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .insert(ack_id, message);
                            }
                        }

                        handler.process_message(received).await;
                    }
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(max_backoff);
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to pull messages from Pub/Sub, retrying after backoff"
                    );
                    handler
                        .process_error(BrokerError::Transport(e.to_string()))
                        .await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl SubscriptionReceiver for PubSubReceiver {
    fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }

    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(BrokerError::Transport(format!(
                "subscription {} already has a receiver",
                self.subscription.id()
            )));
        }

        *task = Some(tokio::spawn(Self::pull_loop(
            self.subscription.clone(),
            handler,
            self.mode,
            self.batch_size,
            self.max_backoff,
            self.pending.clone(),
        )));
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

        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .ok_or_else(|| BrokerError::NotFound(format!("lock {}", token)))?;

        pending
            .ack()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to ack message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            debug!(subscription = %self.subscription.id(), "Pub/Sub pull loop stopped");
        }
        // Unsettled messages are redelivered after their ack deadline.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
