//! Per-namespace adapter.
//!
//! Wraps the namespace's `ClusterHandler`: `init` waits for the connection's
//! provisioning, `close` deregisters the namespace after the handler's own
//! cleanup, and inbound messages are filtered before reaching the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::ReceivedMessage;
use crate::cluster::{
    ClusterHandler, ClusterMessage, ClusterResponse, ClusterTransport, Offset, ServerId,
};

use super::{BusError, Codec, Connection, InboundSink, MsgPackCodec, Result, RoutingEnvelope};

/// Namespace adapter bound to one connection.
pub struct NamespaceAdapter<H, C = MsgPackCodec> {
    nsp: String,
    uid: ServerId,
    handler: H,
    connection: Arc<Connection<C>>,
    closed: AtomicBool,
}

impl<H: ClusterHandler, C: Codec> NamespaceAdapter<H, C> {
    pub(crate) fn new(nsp: String, handler: H, connection: Arc<Connection<C>>) -> Self {
        Self {
            nsp,
            uid: ServerId::random(),
            handler,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.nsp
    }

    pub fn uid(&self) -> &ServerId {
        &self.uid
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn connection(&self) -> &Arc<Connection<C>> {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the connection's subscription, then initialize the handler.
    pub async fn init(&self) -> Result<()> {
        self.ensure_open()?;
        self.connection.ready().await?;
        // The adapter may have been closed while provisioning was pending.
        self.ensure_open()?;
        self.handler.init().await?;
        debug!(nsp = %self.nsp, uid = %self.uid, "Namespace adapter initialized");
        Ok(())
    }

    /// Close the handler, deregister the namespace and, for the last adapter
    /// of the connection, release the shared broker resources.
    ///
    /// Calling `close` more than once has no further effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handler.close().await;
        self.connection.release(&self.nsp, &self.uid).await;
        info!(nsp = %self.nsp, uid = %self.uid, "Namespace adapter closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::AdapterClosed(self.nsp.clone()));
        }
        Ok(())
    }

    async fn handle_raw(
        &self,
        envelope: &RoutingEnvelope,
        message: &ReceivedMessage,
    ) -> Result<()> {
        if envelope.uid == self.uid {
            debug!(nsp = %self.nsp, "Ignore message from self");
            return Ok(());
        }

        if let Some(requester_uid) = &envelope.requester_uid {
            if *requester_uid != self.uid {
                debug!(
                    nsp = %self.nsp,
                    requester_uid = %requester_uid,
                    "Ignore response for another node"
                );
                return Ok(());
            }

            let response: ClusterResponse =
                self.connection.publisher().codec().decode(&message.body)?;
            debug!(nsp = %self.nsp, kind = ?response.kind, "Received response");
            self.handler.on_response(response).await;
        } else {
            let cluster_message: ClusterMessage =
                self.connection.publisher().codec().decode(&message.body)?;
            debug!(
                nsp = %self.nsp,
                from = %cluster_message.uid,
                kind = ?cluster_message.kind,
                "Received message"
            );
            self.handler.on_message(cluster_message).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<H: ClusterHandler, C: Codec> ClusterTransport for NamespaceAdapter<H, C> {
    async fn do_publish(&self, message: &ClusterMessage) -> Result<Option<Offset>> {
        self.ensure_open()?;
        let receipt = self
            .connection
            .publisher()
            .publish(&self.nsp, &self.uid, message)
            .await?;
        Ok(receipt.message_id)
    }

    async fn do_publish_response(
        &self,
        requester_uid: &ServerId,
        response: &ClusterResponse,
    ) -> Result<()> {
        self.ensure_open()?;
        self.connection
            .publisher()
            .publish_response(&self.nsp, &self.uid, requester_uid, response)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<H: ClusterHandler, C: Codec> InboundSink for NamespaceAdapter<H, C> {
    fn uid(&self) -> &ServerId {
        &self.uid
    }

    async fn on_raw_message(&self, envelope: &RoutingEnvelope, message: &ReceivedMessage) {
        if let Err(e) = self.handle_raw(envelope, message).await {
            warn!(
                nsp = %self.nsp,
                message_id = %message.message_id,
                error = %e,
                "Dropping undecodable message"
            );
        }
    }
}
