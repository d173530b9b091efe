//! Topic and subscription provisioning.

use futures::future::{BoxFuture, Shared};
use tracing::{debug, info};

use crate::broker::AdminClient;
use crate::config::{SubscriptionOptions, TopicOptions};

use super::{BusError, Result};

/// Names of the resources a connection consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedResources {
    pub topic_name: String,
    pub subscription_name: String,
}

/// Provisioning outcome memoized and shared by every waiter.
pub type SharedProvisioning = Shared<BoxFuture<'static, Result<ProvisionedResources>>>;

/// Ensure the topic exists, then create the subscription bound to it.
///
/// A missing topic is created; losing a creation race to another server is
/// not an error. The subscription is always created since its name is unique
/// to the calling connection.
pub async fn ensure(
    admin: &dyn AdminClient,
    topic_name: &str,
    subscription_name: &str,
    topic_options: &TopicOptions,
    subscription_options: &SubscriptionOptions,
) -> Result<ProvisionedResources> {
    match admin.get_topic(topic_name).await {
        Ok(_) => {
            debug!(topic = %topic_name, "Topic already exists");
        }
        Err(e) if e.is_not_found() => {
            debug!(topic = %topic_name, "Topic does not exist");
            match admin.create_topic(topic_name, topic_options).await {
                Ok(_) => info!(topic = %topic_name, "Created topic"),
                Err(e) if e.is_already_exists() => {
                    debug!(topic = %topic_name, "Topic was created concurrently");
                }
                Err(e) => {
                    return Err(BusError::Provisioning(format!(
                        "Failed to create topic {}: {}",
                        topic_name, e
                    )));
                }
            }
        }
        Err(e) => {
            return Err(BusError::Provisioning(format!(
                "Failed to fetch topic {}: {}",
                topic_name, e
            )));
        }
    }

    debug!(subscription = %subscription_name, "Creating subscription");

    admin
        .create_subscription(topic_name, subscription_name, subscription_options)
        .await
        .map_err(|e| {
            BusError::Provisioning(format!(
                "Failed to create subscription {}: {}",
                subscription_name, e
            ))
        })?;

    info!(
        topic = %topic_name,
        subscription = %subscription_name,
        "Created subscription"
    );

    Ok(ProvisionedResources {
        topic_name: topic_name.to_string(),
        subscription_name: subscription_name.to_string(),
    })
}
