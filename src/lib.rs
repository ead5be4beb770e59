//! A minimal Kafka producer for a single topic partition on a single broker, re-establishing its
//! connection transparently when the broker closes it.

mod broker;
mod codec;
mod config;
mod error;
mod message;
mod producer;

pub use kafka_protocol;
pub use kafka_protocol::indexmap;

pub use broker::ConnectionState;
pub use codec::{FrameEncoder, PRODUCE_API_VERSION};
pub use config::{Acks, ProducerConfig, ProducerOptions, DEFAULT_HOST, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use error::{BrokerErrorKind, ClientError};
pub use kafka_protocol::indexmap::IndexMap;
pub use kafka_protocol::protocol::StrBytes;
pub use message::{Message, MessageHeaders, Payload, Payloads};
pub use producer::{Producer, Result, SendOptions};
