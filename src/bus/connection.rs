//! Physical broker connection shared by namespace adapters.
//!
//! One connection owns one sender, one receiver and one subscription on the
//! shared topic. Provisioning runs at most once per connection: every
//! adapter's `init` awaits the same memoized future.

use std::sync::Arc;

use futures::future::FutureExt;
use tracing::{debug, info};

use crate::broker::{AdminClient, BrokerClient, SubscriptionReceiver};
use crate::cluster::{random_id, ClusterHandler, ServerId};
use crate::config::AdapterOptions;

use super::{
    ensure, BusError, Codec, LifecycleCoordinator, MsgPackCodec, NamespaceAdapter,
    NamespaceRegistry, ProvisionedResources, Publisher, Result, Router, SharedProvisioning,
};

/// Shared broker resources of one server process.
pub struct Connection<C = MsgPackCodec> {
    topic_name: String,
    subscription_name: String,
    registry: Arc<NamespaceRegistry>,
    publisher: Publisher<C>,
    provisioning: SharedProvisioning,
    lifecycle: LifecycleCoordinator,
}

impl Connection<MsgPackCodec> {
    /// Create a connection using the MessagePack codec.
    pub fn new(
        client: &dyn BrokerClient,
        admin: Arc<dyn AdminClient>,
        options: AdapterOptions,
    ) -> Arc<Self> {
        Self::with_codec(client, admin, options, MsgPackCodec)
    }
}

impl<C: Codec> Connection<C> {
    /// Create a connection with a custom payload codec.
    ///
    /// No broker I/O happens here; provisioning starts when the first adapter
    /// initializes (or `ready` is awaited).
    pub fn with_codec(
        client: &dyn BrokerClient,
        admin: Arc<dyn AdminClient>,
        options: AdapterOptions,
        codec: C,
    ) -> Arc<Self> {
        let topic_name = options.topic_name.clone();
        let subscription_name = format!("{}-{}", options.subscription_prefix, random_id());

        let sender = client.create_sender(&topic_name);
        let receiver =
            client.create_receiver(&topic_name, &subscription_name, &options.receiver_options);

        let registry = Arc::new(NamespaceRegistry::new());
        let router = Arc::new(Router::new(
            registry.clone(),
            receiver.clone(),
            subscription_name.clone(),
        ));

        let provisioning = provision(
            registry.clone(),
            admin.clone(),
            receiver.clone(),
            router,
            options,
            subscription_name.clone(),
        )
        .boxed()
        .shared();

        let lifecycle = LifecycleCoordinator::new(
            provisioning.clone(),
            admin,
            sender.clone(),
            receiver,
            topic_name.clone(),
            subscription_name.clone(),
        );

        debug!(
            topic = %topic_name,
            subscription = %subscription_name,
            "Connection created"
        );

        Arc::new(Self {
            topic_name,
            subscription_name,
            registry,
            publisher: Publisher::new(sender, codec),
            provisioning,
            lifecycle,
        })
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher<C> {
        &self.publisher
    }

    /// True once the last adapter has closed. Teardown of the shared
    /// resources starts at that point.
    pub fn is_closed(&self) -> bool {
        self.registry.is_sealed()
    }

    /// Wait until the subscription exists and the router is receiving.
    ///
    /// The outcome, success or failure, is shared by every caller. Fails with
    /// `BusError::ConnectionClosed` once the connection was torn down.
    pub async fn ready(&self) -> Result<ProvisionedResources> {
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        let resources = self.provisioning.clone().await?;
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        Ok(resources)
    }

    /// Create and register the adapter of namespace `nsp`.
    ///
    /// Fails when the namespace already has an adapter on this connection, or
    /// when the connection was torn down.
    pub fn create_adapter<H: ClusterHandler>(
        self: &Arc<Self>,
        nsp: impl Into<String>,
        handler: H,
    ) -> Result<Arc<NamespaceAdapter<H, C>>> {
        let nsp = nsp.into();
        let adapter = Arc::new(NamespaceAdapter::new(nsp.clone(), handler, self.clone()));
        // A sealed registry rejects the registration with `ConnectionClosed`.
        self.registry.register(&nsp, adapter.clone())?;

        info!(
            nsp = %nsp,
            uid = %adapter.uid(),
            subscription = %self.subscription_name,
            "Namespace adapter registered"
        );
        Ok(adapter)
    }

    /// Deregister an adapter and release the shared resources if it was the last.
    pub(crate) async fn release(&self, nsp: &str, uid: &ServerId) {
        match self.registry.unregister(nsp, uid) {
            Some(remaining) => self.lifecycle.on_adapter_closed(remaining).await,
            None => debug!(nsp = %nsp, uid = %uid, "Adapter was not registered"),
        }
    }
}

/// Create topic and subscription, then start the receive loop.
///
/// Refuses to start once the connection was torn down.
async fn provision(
    registry: Arc<NamespaceRegistry>,
    admin: Arc<dyn AdminClient>,
    receiver: Arc<dyn SubscriptionReceiver>,
    router: Arc<Router>,
    options: AdapterOptions,
    subscription_name: String,
) -> Result<ProvisionedResources> {
    if registry.is_sealed() {
        debug!(subscription = %subscription_name, "Connection closed before provisioning");
        return Err(BusError::ConnectionClosed);
    }

    let resources = ensure(
        admin.as_ref(),
        &options.topic_name,
        &subscription_name,
        &options.topic_options,
        &options.subscription_options,
    )
    .await
    .inspect_err(|e| {
        tracing::error!(
            subscription = %subscription_name,
            error = %e,
            "An error has occurred while creating the subscription"
        );
    })?;

    receiver.subscribe(router).await.map_err(|e| {
        BusError::Provisioning(format!(
            "Failed to start receiving from {}: {}",
            subscription_name, e
        ))
    })?;

    info!(
        topic = %resources.topic_name,
        subscription = %resources.subscription_name,
        "Receiving from subscription"
    );
    Ok(resources)
}
