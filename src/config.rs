//! Producer configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ClientError;

/// The default broker host.
pub const DEFAULT_HOST: &str = "localhost";
/// The default broker port.
pub const DEFAULT_PORT: u16 = 9092;
/// The default max size of a single message (1MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// The default timeout used for requests (10s).
pub const DEFAULT_TIMEOUT: i32 = 10 * 1000;
/// The default interval of TCP keep-alive probes (1s).
pub const DEFAULT_KEEPALIVE_MS: u64 = 1000;

/// Write acknowledgements required for a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Acks {
    /// Leader and replicas.
    All = -1,
    /// None. The broker sends no response at all.
    #[default]
    None = 0,
    /// Leader only.
    Leader = 1,
}

/// Options of a producer, everything but its topic.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerOptions {
    /// The partition produced to when a send does not name one.
    pub partition: i32,
    /// The broker host.
    pub host: String,
    /// The broker port.
    pub port: u16,
    /// The client ID sent in request headers.
    pub client_id: Option<String>,
    /// Acks level to use for produce requests.
    pub acks: Acks,
    /// Timeout for produce requests, in milliseconds.
    pub timeout_ms: i32,
    /// The largest accepted size of a single message, in bytes.
    pub max_message_size: usize,
    /// Interval between TCP keep-alive probes, in milliseconds.
    pub keepalive_ms: u64,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            partition: 0,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            client_id: Some(env!("CARGO_PKG_NAME").to_string()),
            acks: Acks::default(),
            timeout_ms: DEFAULT_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
        }
    }
}

impl ProducerOptions {
    /// Set the default partition.
    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    /// Set the broker host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the broker port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client ID, or `None` to omit it.
    pub fn client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// Set the acks level.
    pub fn acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }

    /// Set the request timeout.
    pub fn timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the max size of a single message.
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set the keep-alive probe interval, in whole milliseconds.
    ///
    /// Intervals below one millisecond round down to zero, which `validate` rejects.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check the options for values no connection can be opened with.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.keepalive_ms == 0 {
            return Err(ClientError::InvalidConfig("keepalive_ms must be greater than zero".into()));
        }
        Ok(())
    }

    /// The `host:port` address of the broker.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

/// A full producer configuration, as loaded from a TOML document.
///
/// ```toml
/// topic = "events"
///
/// [options]
/// host = "kafka-0"
/// port = 9092
/// partition = 3
/// acks = "leader"
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    /// The topic produced to.
    pub topic: String,
    /// All other producer options.
    #[serde(default)]
    pub options: ProducerOptions,
}

impl ProducerConfig {
    /// Construct a new instance.
    pub fn new(topic: impl Into<String>, options: ProducerOptions) -> Self {
        Self { topic: topic.into(), options }
    }

    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(doc: &str) -> Result<Self, ClientError> {
        let config: Self = toml::from_str(doc).map_err(|err| ClientError::InvalidConfig(err.to_string()))?;
        if config.topic.is_empty() {
            return Err(ClientError::InvalidTopic);
        }
        config.options.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|err| ClientError::InvalidConfig(format!("error reading {}: {}", path.display(), err)))?;
        Self::from_toml_str(&doc)
    }
}
