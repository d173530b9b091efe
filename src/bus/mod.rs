//! Cluster bus over a shared broker topic.
//!
//! This module contains:
//! - `Connection`: one physical broker connection shared by many namespaces
//! - `NamespaceAdapter`: per-namespace publish/receive façade
//! - `Router`: inbound dispatch by namespace
//! - `Publisher`, `RoutingEnvelope`, `Codec`: the outbound path
//! - `provision`: topic and subscription setup
//! - `LifecycleCoordinator`: teardown when the last namespace closes

pub mod adapter;
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod lifecycle;
pub mod provision;
pub mod publisher;
pub mod registry;
pub mod router;

pub use adapter::NamespaceAdapter;
pub use codec::{Codec, MsgPackCodec};
pub use connection::Connection;
pub use envelope::RoutingEnvelope;
pub use lifecycle::LifecycleCoordinator;
pub use provision::{ensure, ProvisionedResources, SharedProvisioning};
pub use publisher::Publisher;
pub use registry::{InboundSink, NamespaceRegistry};
pub use router::{RouteOutcome, Router};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Namespace '{0}' is already registered on this connection")]
    NamespaceAlreadyRegistered(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Adapter for namespace '{0}' is closed")]
    AdapterClosed(String),
}
