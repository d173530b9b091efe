//! Outbound publish path.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::broker::{OutboundMessage, SendReceipt, TopicSender};
use crate::cluster::ServerId;

use super::{BusError, Codec, Result, RoutingEnvelope};

/// Encodes payloads and sends them with routing metadata through the
/// connection's shared sender.
///
/// Retries are left to the broker client.
pub struct Publisher<C> {
    sender: Arc<dyn TopicSender>,
    codec: C,
}

impl<C: Codec> Publisher<C> {
    pub fn new(sender: Arc<dyn TopicSender>, codec: C) -> Self {
        Self { sender, codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Broadcast `payload` to every server hosting `nsp`.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        nsp: &str,
        uid: &ServerId,
        payload: &T,
    ) -> Result<SendReceipt> {
        self.send(RoutingEnvelope::broadcast(nsp, uid.clone()), payload)
            .await
    }

    /// Send `payload` as a response addressed to `requester_uid`.
    pub async fn publish_response<T: Serialize + Sync>(
        &self,
        nsp: &str,
        uid: &ServerId,
        requester_uid: &ServerId,
        payload: &T,
    ) -> Result<SendReceipt> {
        self.send(
            RoutingEnvelope::response(nsp, uid.clone(), requester_uid.clone()),
            payload,
        )
        .await
    }

    async fn send<T: Serialize + Sync>(
        &self,
        envelope: RoutingEnvelope,
        payload: &T,
    ) -> Result<SendReceipt> {
        let body = self.codec.encode(payload)?;
        let message = OutboundMessage {
            body: Bytes::from(body),
            application_properties: envelope.to_properties(),
        };

        let receipt = self
            .sender
            .send(message)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        debug!(
            nsp = %envelope.nsp,
            uid = %envelope.uid,
            response = envelope.is_response(),
            message_id = ?receipt.message_id,
            "Published message"
        );

        Ok(receipt)
    }
}
