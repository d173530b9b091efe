//! Cluster adapter contract.
//!
//! The cluster-consistency logic (heartbeats, node liveness, replay) lives behind
//! `ClusterHandler`. A `NamespaceAdapter` wraps one handler and supplies the
//! publish hooks described by `ClusterTransport`.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::bus::Result;

/// Offset returned by a broadcast publish (the broker message id, when known).
pub type Offset = String;

/// Identifier of one namespace adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for ServerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// 16 lowercase hex characters (8 random bytes).
pub(crate) fn random_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..8])
}

/// Kind of a cluster message, encoded as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MessageType {
    InitialHeartbeat = 1,
    Heartbeat = 2,
    Broadcast = 3,
    SocketsJoin = 4,
    SocketsLeave = 5,
    DisconnectSockets = 6,
    FetchSockets = 7,
    FetchSocketsResponse = 8,
    ServerSideEmit = 9,
    ServerSideEmitResponse = 10,
    BroadcastClientCount = 11,
    BroadcastAck = 12,
    AdapterClose = 13,
}

/// A message fanned out to every server in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub uid: ServerId,
    pub nsp: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A reply addressed to the server that issued a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResponse {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Cluster-consistency logic of one namespace.
///
/// `NamespaceAdapter` calls `init` only once the connection's subscription is
/// live, and calls `close` before deregistering the namespace.
#[async_trait]
pub trait ClusterHandler: Send + Sync + 'static {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    /// A broadcast from another server.
    async fn on_message(&self, message: ClusterMessage);

    /// A response addressed to this server.
    async fn on_response(&self, response: ClusterResponse);
}

/// Publish hooks the cluster logic relies on.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Broadcast a message to every other server.
    async fn do_publish(&self, message: &ClusterMessage) -> Result<Option<Offset>>;

    /// Send a response to the server identified by `requester_uid`.
    async fn do_publish_response(
        &self,
        requester_uid: &ServerId,
        response: &ClusterResponse,
    ) -> Result<()>;
}
