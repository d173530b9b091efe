//! Adapter configuration.
//!
//! Options recognized by a physical connection, loadable from YAML files or
//! environment variables.

use serde::Deserialize;

use crate::broker::ReceiveMode;

/// Default topic shared by every server in the cluster.
pub const DEFAULT_TOPIC_NAME: &str = "socket.io";
/// Default prefix of the per-connection subscription.
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "socket.io";
/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "cluster-topic.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CLUSTER_TOPIC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CLUSTER_TOPIC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CLUSTER_TOPIC_LOG";

/// Options for one physical connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    /// Name of the shared topic.
    pub topic_name: String,
    /// Options used when the topic has to be created.
    pub topic_options: TopicOptions,
    /// Prefix of the subscription; one subscription is created per connection.
    pub subscription_prefix: String,
    /// Options used to create the subscription.
    pub subscription_options: SubscriptionOptions,
    /// Options used to create the receiver.
    pub receiver_options: ReceiverOptions,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            topic_name: DEFAULT_TOPIC_NAME.to_string(),
            topic_options: TopicOptions::default(),
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
            subscription_options: SubscriptionOptions::default(),
            receiver_options: ReceiverOptions::default(),
        }
    }
}

impl AdapterOptions {
    /// Set topic name.
    pub fn with_topic_name(mut self, name: impl Into<String>) -> Self {
        self.topic_name = name.into();
        self
    }

    /// Set subscription prefix.
    pub fn with_subscription_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subscription_prefix = prefix.into();
        self
    }

    pub fn with_topic_options(mut self, options: TopicOptions) -> Self {
        self.topic_options = options;
        self
    }

    pub fn with_subscription_options(mut self, options: SubscriptionOptions) -> Self {
        self.subscription_options = options;
        self
    }

    /// Set receive mode.
    pub fn with_receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.receiver_options.receive_mode = mode;
        self
    }

    /// Load options from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `DEFAULT_CONFIG_FILE` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Broker-specific topic creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicOptions {
    /// Maximum size of the topic in megabytes.
    pub max_size_in_megabytes: Option<u64>,
    /// Time-to-live applied to messages that do not carry their own.
    pub default_message_ttl_secs: Option<u64>,
}

/// Broker-specific subscription creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// How long a peek-locked message stays invisible to other receivers.
    pub lock_duration_secs: Option<u64>,
    /// Deliveries before a message is dead-lettered.
    pub max_delivery_count: Option<u32>,
    /// Idle interval after which the broker reclaims the subscription.
    ///
    /// Ignored by backends without idle reclamation (Pub/Sub logs it and
    /// keeps its default expiration policy).
    pub auto_delete_on_idle_secs: Option<u64>,
}

/// Broker-specific receiver parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    pub receive_mode: ReceiveMode,
    /// Messages fetched per round trip (0 lets the backend choose).
    pub prefetch_count: u32,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::PeekLock,
            prefetch_count: 0,
        }
    }
}
