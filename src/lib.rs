//! Cluster Topic Adapter
//!
//! Lets independent real-time servers exchange cluster messages through a
//! shared topic on a managed broker. Each server process opens one
//! [`bus::Connection`] and registers one [`bus::NamespaceAdapter`] per
//! namespace; all adapters of a process share a single subscription.

pub mod broker;
pub mod bus;
pub mod cluster;
pub mod config;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

pub use bus::{BusError, Connection, NamespaceAdapter};
pub use cluster::{ClusterHandler, ClusterMessage, ClusterResponse, ClusterTransport, MessageType};
pub use config::AdapterOptions;
