//! Kafka producer implementation.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::broker::{Broker, ConnectionState};
use crate::codec::FrameEncoder;
use crate::config::{ProducerConfig, ProducerOptions};
use crate::error::ClientError;
use crate::message::Payloads;

/// Client results from interaction with a Kafka broker.
pub type Result<T> = std::result::Result<T, ClientError>;

/// A producer for a single topic on a single broker.
///
/// This producer is `Send + Sync + Clone`, and cloning it to share among application tasks is
/// encouraged; all clones share one broker connection.
///
/// The connection is managed by a task spawned at construction, so a producer must be built within
/// a Tokio runtime. The connection is opened by [`Producer::connect`] or by the first send, and is
/// transparently re-established when a send finds the socket closed.
///
/// Sends are not guaranteed to reach the broker in the order they were issued once a reconnect is
/// involved: a send which triggered the reconnect writes only after it resolves, while sends issued
/// during the attempt are written as soon as the new connection is up.
#[derive(Clone)]
pub struct Producer {
    /// The connection to the broker.
    broker: Arc<Broker>,
    /// The encoder used for all produce requests.
    encoder: FrameEncoder,
    /// The topic being produced to.
    topic: Arc<str>,
    /// The partition produced to when a send does not name one.
    partition: i32,
}

/// Per-send overrides of the producer's topic & partition.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// The topic to produce to instead of the producer's topic.
    pub topic: Option<String>,
    /// The partition to produce to instead of the producer's default partition.
    pub partition: Option<i32>,
}

impl SendOptions {
    /// Override the topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Override the partition.
    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

impl Producer {
    /// Construct a new instance.
    ///
    /// Fails if the topic is empty or the options are invalid. No connection is opened here.
    pub fn new(topic: &str, options: ProducerOptions) -> Result<Self> {
        if topic.is_empty() {
            return Err(ClientError::InvalidTopic);
        }
        options.validate()?;
        let broker = Broker::new(options.broker_addr(), options.keepalive_interval());
        Ok(Self {
            broker: Arc::new(broker),
            encoder: FrameEncoder::new(&options),
            topic: Arc::from(topic),
            partition: options.partition,
        })
    }

    /// Construct a new instance from a loaded configuration.
    pub fn from_config(config: ProducerConfig) -> Result<Self> {
        Self::new(&config.topic, config.options)
    }

    /// The topic being produced to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The partition produced to when a send does not name one.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The current state of the broker connection.
    pub fn state(&self) -> ConnectionState {
        self.broker.state()
    }

    /// A receiver which observes every change of the broker connection state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.broker.watch_state()
    }

    /// The number of connection attempts made so far, by `connect` or by sends.
    ///
    /// Callers joining an attempt already in flight do not add to this count.
    pub fn connect_attempts(&self) -> u64 {
        self.broker.connect_attempts()
    }

    /// Open the connection to the broker.
    ///
    /// Does nothing if already connected, and waits on the pending attempt if one is in flight.
    pub async fn connect(&self) -> Result<()> {
        self.broker.connect().await.map_err(ClientError::from)
    }

    /// Produce the given payloads as a single request.
    ///
    /// If the write finds the socket already closed, the connection is re-established and the same
    /// request is written once more; the outcome of that second write is the outcome of the send.
    /// A refused reconnect fails with `ClientError::BrokerReconnect`. No other error leads to a
    /// reconnect.
    pub async fn send(&self, payloads: impl Into<Payloads>, options: Option<SendOptions>) -> Result<()> {
        let options = options.unwrap_or_default();
        let topic = options.topic.as_deref().unwrap_or(&*self.topic);
        let partition = options.partition.unwrap_or(self.partition);
        let messages = payloads.into().into_messages();
        let frame = self.encoder.encode(topic, partition, &messages)?;
        tracing::trace!(topic, partition, messages = messages.len(), len = frame.len(), "sending produce request");

        match self.broker.write(frame.clone()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_socket_closed() => {
                tracing::debug!(topic, partition, "broker socket closed, reconnecting before retrying the send");
                self.reconnect_then_write(frame).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Re-establish the connection & write the frame one final time.
    async fn reconnect_then_write(&self, frame: Bytes) -> Result<()> {
        self.broker.connect().await?;
        self.broker.write(frame).await.map_err(ClientError::from)
    }
}
