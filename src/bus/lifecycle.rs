//! Teardown of the resources shared by a connection's adapters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{AdminClient, SubscriptionReceiver, TopicSender};

use super::{BusError, SharedProvisioning};

/// Closes the sender and receiver and deletes the subscription once the last
/// namespace adapter of the connection has gone away.
///
/// Teardown waits for provisioning in flight, so a subscription created
/// concurrently with the last close is still deleted. The topic is never
/// deleted: other connections publish to it.
pub struct LifecycleCoordinator {
    provisioning: SharedProvisioning,
    admin: Arc<dyn AdminClient>,
    sender: Arc<dyn TopicSender>,
    receiver: Arc<dyn SubscriptionReceiver>,
    topic_name: String,
    subscription_name: String,
    closed: AtomicBool,
}

impl LifecycleCoordinator {
    pub fn new(
        provisioning: SharedProvisioning,
        admin: Arc<dyn AdminClient>,
        sender: Arc<dyn TopicSender>,
        receiver: Arc<dyn SubscriptionReceiver>,
        topic_name: impl Into<String>,
        subscription_name: impl Into<String>,
    ) -> Self {
        Self {
            provisioning,
            admin,
            sender,
            receiver,
            topic_name: topic_name.into(),
            subscription_name: subscription_name.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Called once per adapter close, after it was removed from the registry,
    /// with the number of adapters still registered.
    ///
    /// Cleanup failures are logged and swallowed.
    pub async fn on_adapter_closed(&self, remaining: usize) {
        if remaining > 0 {
            debug!(
                subscription = %self.subscription_name,
                remaining,
                "Connection still serves other namespaces"
            );
            return;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // The provisioning future refuses to start once the connection is
        // closed, so this only waits for work that began before the last close.
        let provisioned = match self.provisioning.clone().await {
            Ok(_) => true,
            Err(BusError::ConnectionClosed) => false,
            Err(e) => {
                debug!(
                    subscription = %self.subscription_name,
                    error = %e,
                    "Provisioning had failed before teardown"
                );
                true
            }
        };

        let deletion = async {
            if !provisioned {
                debug!(subscription = %self.subscription_name, "Subscription was never provisioned");
                return None;
            }
            info!(subscription = %self.subscription_name, "Deleting subscription");
            Some(
                self.admin
                    .delete_subscription(&self.topic_name, &self.subscription_name)
                    .await,
            )
        };

        let (receiver, sender, deletion) =
            futures::join!(self.receiver.close(), self.sender.close(), deletion);

        if let Err(e) = receiver {
            log_cleanup_error(BusError::Cleanup(format!("receiver close: {}", e)));
        }
        if let Err(e) = sender {
            log_cleanup_error(BusError::Cleanup(format!("sender close: {}", e)));
        }
        match deletion {
            None => {}
            Some(Ok(())) => info!(
                subscription = %self.subscription_name,
                "Subscription was successfully deleted"
            ),
            Some(Err(e)) => log_cleanup_error(BusError::Cleanup(format!(
                "subscription {} deletion: {}",
                self.subscription_name, e
            ))),
        }
    }
}

fn log_cleanup_error(error: BusError) {
    warn!(error = %error, "An error has occurred during teardown");
}
