//! Inbound dispatch of the shared subscription.
//!
//! Every subscription on the topic sees every message, whatever its namespace,
//! so filtering by namespace happens here after delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn, Instrument};

use crate::broker::{
    BrokerError, MessageHandler, ReceiveMode, ReceivedMessage, SubscriptionReceiver,
};

use super::{NamespaceRegistry, RoutingEnvelope};

/// Result of routing one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the namespace adapter.
    Delivered,
    /// Routing metadata missing or invalid; dropped.
    Malformed,
    /// No adapter hosts the namespace on this connection; dropped.
    UnknownNamespace,
}

/// Dispatches messages from the connection's receiver to namespace adapters.
pub struct Router {
    registry: Arc<NamespaceRegistry>,
    receiver: Arc<dyn SubscriptionReceiver>,
    subscription: String,
}

impl Router {
    pub fn new(
        registry: Arc<NamespaceRegistry>,
        receiver: Arc<dyn SubscriptionReceiver>,
        subscription: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            receiver,
            subscription: subscription.into(),
        }
    }

    /// Route one message, then settle it when the receiver is in peek-lock mode.
    ///
    /// Dropped messages are settled as well; redelivering them cannot change
    /// the outcome.
    pub async fn route(&self, message: ReceivedMessage) -> RouteOutcome {
        let outcome = self.dispatch(&message).await;

        if self.receiver.receive_mode() == ReceiveMode::PeekLock {
            if let Err(e) = self.receiver.complete_message(&message).await {
                warn!(
                    subscription = %self.subscription,
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to complete message"
                );
            }
        }

        outcome
    }

    async fn dispatch(&self, message: &ReceivedMessage) -> RouteOutcome {
        let envelope =
            match RoutingEnvelope::from_properties(message.application_properties.as_ref()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(
                        message_id = %message.message_id,
                        error = %e,
                        "Ignoring malformed message"
                    );
                    return RouteOutcome::Malformed;
                }
            };

        let Some(adapter) = self.registry.get(&envelope.nsp) else {
            debug!(nsp = %envelope.nsp, "Ignoring message for unknown namespace");
            return RouteOutcome::UnknownNamespace;
        };

        let span = tracing::debug_span!("bus.route", nsp = %envelope.nsp, uid = %envelope.uid);
        adapter
            .on_raw_message(&envelope, message)
            .instrument(span)
            .await;
        RouteOutcome::Delivered
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn process_message(&self, message: ReceivedMessage) {
        self.route(message).await;
    }

    async fn process_error(&self, error: BrokerError) {
        error!(
            subscription = %self.subscription,
            error = %error,
            "An error has occurred while receiving"
        );
    }
}
