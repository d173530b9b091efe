//! Managed broker client interface.
//!
//! This module contains:
//! - `AdminClient` trait: topic and subscription management
//! - `BrokerClient` trait: sender/receiver factories for one topic
//! - `TopicSender` / `SubscriptionReceiver` traits: the data plane
//! - `MessageHandler` trait: callbacks driven by a receiver's loop
//! - Implementations: in-memory, Google Pub/Sub

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::config::{ReceiverOptions, SubscriptionOptions, TopicOptions};

// Implementation modules
pub mod memory;
#[cfg(feature = "pubsub")]
pub mod pubsub;

// Re-exports
pub use memory::{BrokerStats, InMemoryBroker};
#[cfg(feature = "pubsub")]
pub use pubsub::{PubSubBroker, PubSubBrokerConfig};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Client is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A typed application property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl PropertyValue {
    /// Returns the string value, or `None` for non-string properties.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Message-level metadata carried out-of-band from the body.
pub type ApplicationProperties = HashMap<String, PropertyValue>;

/// A message handed to a sender.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub application_properties: ApplicationProperties,
}

/// A message delivered by a receiver.
#[derive(Debug, Clone, Default)]
pub struct ReceivedMessage {
    /// Broker-assigned identifier.
    pub message_id: String,
    pub body: Bytes,
    /// `None` when the publisher attached no properties at all.
    pub application_properties: Option<ApplicationProperties>,
    /// Settlement handle for peek-lock delivery.
    pub lock_token: Option<String>,
}

/// Acknowledgment returned by a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Broker-assigned message identifier, when the broker reports one.
    pub message_id: Option<String>,
}

/// How a receiver settles delivered messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiveMode {
    /// Messages stay locked until explicitly completed, otherwise they are redelivered.
    #[default]
    PeekLock,
    /// Messages are removed from the subscription as soon as they are delivered.
    ReceiveAndDelete,
}

// ============================================================================
// Traits
// ============================================================================

/// Topic metadata returned by `AdminClient::get_topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicProperties {
    pub name: String,
}

/// Administrative operations on broker resources.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Fetch a topic. Returns `BrokerError::NotFound` when it does not exist.
    async fn get_topic(&self, name: &str) -> Result<TopicProperties>;

    /// Create a topic. Returns `BrokerError::AlreadyExists` when another client won the race.
    async fn create_topic(&self, name: &str, options: &TopicOptions) -> Result<TopicProperties>;

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<()>;

    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<()>;
}

/// Factories for the data-plane clients of a topic.
///
/// Creating a sender or receiver performs no I/O; the underlying resources
/// may not exist yet.
pub trait BrokerClient: Send + Sync {
    fn create_sender(&self, topic: &str) -> Arc<dyn TopicSender>;

    fn create_receiver(
        &self,
        topic: &str,
        subscription: &str,
        options: &ReceiverOptions,
    ) -> Arc<dyn SubscriptionReceiver>;
}

/// Publishes messages to one topic. Safe for concurrent use.
#[async_trait]
pub trait TopicSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt>;

    async fn close(&self) -> Result<()>;
}

/// Callbacks invoked by a receiver's loop, one message at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_message(&self, message: ReceivedMessage);

    async fn process_error(&self, error: BrokerError);
}

/// Delivers the messages of one subscription. Safe for concurrent use.
#[async_trait]
pub trait SubscriptionReceiver: Send + Sync {
    fn receive_mode(&self) -> ReceiveMode;

    /// Start the receive loop. The loop runs until `close` is called.
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Settle a peek-locked message so it is not redelivered.
    async fn complete_message(&self, message: &ReceivedMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
