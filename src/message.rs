//! Messages and the payload forms accepted by `Producer::send`.

use bytes::Bytes;
use kafka_protocol::indexmap::IndexMap;
use kafka_protocol::protocol::StrBytes;

/// Headers of a message.
pub type MessageHeaders = IndexMap<StrBytes, Option<Bytes>>;

/// A message to be encoded as a Kafka record within a record batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// An optional key for the record.
    pub key: Option<Bytes>,
    /// An optional value as the body of the record.
    pub value: Option<Bytes>,
    /// Optional headers to be included in the record.
    pub headers: MessageHeaders,
    /// An optional creation timestamp in milliseconds since the epoch.
    ///
    /// Left unset, the record carries no timestamp, keeping encoding deterministic.
    pub timestamp: Option<i64>,
}

impl Message {
    /// Construct a new record.
    pub fn new(key: Option<Bytes>, value: Option<Bytes>, headers: MessageHeaders) -> Self {
        Self { key, value, headers, timestamp: None }
    }

    /// Construct a record holding only the given value.
    pub fn from_value(value: impl Into<Bytes>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Set the creation timestamp of this record.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The number of key, value & header bytes this record carries.
    pub(crate) fn payload_size(&self) -> usize {
        let mut size = self.key.as_ref().map(Bytes::len).unwrap_or(0) + self.value.as_ref().map(Bytes::len).unwrap_or(0);
        for (k, v) in self.headers.iter() {
            size += k.len() + v.as_ref().map(Bytes::len).unwrap_or(0);
        }
        size
    }
}

/// A single payload: raw bytes, or an already built message which is passed through as is.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Raw(Bytes),
    Message(Message),
}

impl Payload {
    /// Normalize this payload into a message.
    pub fn into_message(self) -> Message {
        match self {
            Self::Raw(value) => Message::from_value(value),
            Self::Message(msg) => msg,
        }
    }
}

impl From<Message> for Payload {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Raw(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Raw(value.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self::Raw(Bytes::copy_from_slice(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Raw(value.into())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Raw(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// The payloads of a single send: one payload or an ordered sequence of them.
#[derive(Clone, Debug, PartialEq)]
pub enum Payloads {
    Single(Payload),
    Many(Vec<Payload>),
}

impl Payloads {
    /// Normalize into an ordered list of messages, one per payload.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Single(payload) => vec![payload.into_message()],
            Self::Many(payloads) => payloads.into_iter().map(Payload::into_message).collect(),
        }
    }
}

/// Implement the single & sequence conversions into `Payloads` for a payload-like type.
macro_rules! impl_payloads_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Payloads {
                fn from(value: $ty) -> Self {
                    Self::Single(value.into())
                }
            }

            impl From<Vec<$ty>> for Payloads {
                fn from(values: Vec<$ty>) -> Self {
                    Self::Many(values.into_iter().map(Payload::from).collect())
                }
            }
        )*
    };
}

impl_payloads_from!(Message, Bytes, String, &str);

impl From<Payload> for Payloads {
    fn from(value: Payload) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<Payload>> for Payloads {
    fn from(values: Vec<Payload>) -> Self {
        Self::Many(values)
    }
}

impl From<Vec<u8>> for Payloads {
    fn from(value: Vec<u8>) -> Self {
        Self::Single(value.into())
    }
}

impl From<Vec<Vec<u8>>> for Payloads {
    fn from(values: Vec<Vec<u8>>) -> Self {
        Self::Many(values.into_iter().map(Payload::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Payloads {
    fn from(values: [&str; N]) -> Self {
        Self::Many(values.into_iter().map(Payload::from).collect())
    }
}
