//! Namespace registry of one physical connection.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::broker::ReceivedMessage;
use crate::cluster::ServerId;

use super::{BusError, Result, RoutingEnvelope};

/// Receiver side of a namespace adapter, as seen by the router.
#[async_trait]
pub trait InboundSink: Send + Sync {
    fn uid(&self) -> &ServerId;

    /// Handle a message routed to this namespace. Never fails: problems are
    /// logged and the message dropped.
    async fn on_raw_message(&self, envelope: &RoutingEnvelope, message: &ReceivedMessage);
}

#[derive(Default)]
struct RegistryState {
    adapters: HashMap<String, Arc<dyn InboundSink>>,
    sealed: bool,
}

/// Maps namespace names to their live adapter.
///
/// At most one adapter per namespace is registered at any time. Once the last
/// adapter is removed the registry is sealed and accepts no registrations.
#[derive(Default)]
pub struct NamespaceRegistry {
    state: RwLock<RegistryState>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `sink` for `nsp`.
    ///
    /// Rejects a namespace that is already taken, and any registration once
    /// the registry is sealed.
    pub fn register(&self, nsp: &str, sink: Arc<dyn InboundSink>) -> Result<()> {
        let mut state = self.write();
        if state.sealed {
            return Err(BusError::ConnectionClosed);
        }
        if state.adapters.contains_key(nsp) {
            return Err(BusError::NamespaceAlreadyRegistered(nsp.to_string()));
        }
        state.adapters.insert(nsp.to_string(), sink);
        Ok(())
    }

    pub fn get(&self, nsp: &str) -> Option<Arc<dyn InboundSink>> {
        self.read().adapters.get(nsp).cloned()
    }

    /// Remove the adapter `uid` registered for `nsp`.
    ///
    /// Returns the number of adapters left, or `None` when nothing was removed.
    /// Removing the last adapter seals the registry under the same lock, so
    /// exactly one caller observes the transition to zero and no registration
    /// can slip in after it.
    pub fn unregister(&self, nsp: &str, uid: &ServerId) -> Option<usize> {
        let mut state = self.write();
        match state.adapters.get(nsp) {
            Some(sink) if sink.uid() == uid => {
                state.adapters.remove(nsp);
                let remaining = state.adapters.len();
                if remaining == 0 {
                    state.sealed = true;
                }
                Some(remaining)
            }
            _ => None,
        }
    }

    /// True once the last adapter was removed.
    pub fn is_sealed(&self) -> bool {
        self.read().sealed
    }

    pub fn len(&self) -> usize {
        self.read().adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().adapters.keys().cloned().collect();
        names.sort();
        names
    }
}
