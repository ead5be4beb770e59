//! Produce request framing and the broker response codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{produce_request::PartitionProduceData, ApiKey, ProduceRequest, RequestHeader};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::{Encodable, StrBytes};
use kafka_protocol::records::{Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{BytesCodec, Decoder, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::config::{Acks, ProducerOptions};
use crate::error::ClientError;
use crate::message::Message;

/// The default max size for API messages received from Kafka.
const DEFAULT_MAX_SIZE: usize = 1024usize.pow(2) * 16; // 16MiB.

/// The produce API version used for all requests, the first to carry v2 record batches.
pub const PRODUCE_API_VERSION: i16 = 3;

/// The fixed correlation ID of produce frames; responses are never matched to requests.
const CORRELATION_ID: i32 = 0;

pub(crate) type KafkaReader = FramedRead<OwnedReadHalf, KafkaCodecReader>;
pub(crate) type KafkaWriter = FramedWrite<OwnedWriteHalf, BytesCodec>;

/// Construct a new Kafka transport, establishing framed codecs for the reader & writer halves of the given socket.
pub(crate) fn new_kafka_transport(conn: TcpStream, max_size: Option<usize>) -> (KafkaReader, KafkaWriter) {
    let max = max_size.unwrap_or(DEFAULT_MAX_SIZE);
    let codec = LengthDelimitedCodec::builder().big_endian().length_field_length(4).max_frame_length(max).new_codec();

    let (rx, tx) = conn.into_split();
    let framed_tx = FramedWrite::new(tx, BytesCodec::new());
    let framed_rx = FramedRead::new(rx, KafkaCodecReader(codec));

    (framed_rx, framed_tx)
}

/// A codec used for decoding Kafka API responses.
pub(crate) struct KafkaCodecReader(LengthDelimitedCodec);

/// A response received from a Kafka broker.
pub(crate) struct Response {
    /// The correlation ID of this response.
    pub correlation_id: i32,
    /// The full header + body response payload, not including the length delimiter.
    pub body: Bytes,
}

impl Decoder for KafkaCodecReader {
    type Item = Response;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.0.decode(src)? else { return Ok(None) };
        let mut body = frame.freeze();
        if body.len() < 4 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "response frame too short for a correlation ID"));
        }

        // Decode the correlation ID, which will always be the first 4 bytes following the length delimiter.
        let correlation_id = body.peek_bytes(0..4).get_i32();
        Ok(Some(Response { correlation_id, body }))
    }
}

/// Encodes produce requests into length-prefixed frames.
///
/// Encoding is a pure function of the encoder's settings and its inputs: the same topic, partition
/// and messages always yield byte-identical frames.
#[derive(Clone, Debug)]
pub struct FrameEncoder {
    /// The client ID placed in every request header.
    client_id: Option<StrBytes>,
    /// Acks level to use for produce requests.
    acks: Acks,
    /// Timeout for produce requests.
    timeout_ms: i32,
    /// The largest accepted size of a single message.
    max_message_size: usize,
    /// Compression applied to record batches.
    compression: Compression,
}

impl FrameEncoder {
    /// Construct a new instance.
    pub fn new(options: &ProducerOptions) -> Self {
        Self {
            client_id: options.client_id.clone().map(StrBytes::from_string),
            acks: options.acks,
            timeout_ms: options.timeout_ms,
            max_message_size: options.max_message_size,
            compression: Compression::None,
        }
    }

    /// Encode a produce request for the given topic partition holding all of the given messages.
    pub fn encode(&self, topic: &str, partition: i32, messages: &[Message]) -> Result<Bytes, ClientError> {
        if topic.is_empty() {
            return Err(ClientError::InvalidTopic);
        }
        if messages.is_empty() {
            return Err(ClientError::ProducerMessagesEmpty);
        }
        if let Some(size) = messages.iter().map(Message::payload_size).find(|size| *size > self.max_message_size) {
            return Err(ClientError::MessageTooLarge { size, max: self.max_message_size });
        }

        // Transform the given messages into their record form.
        let records: Vec<Record> = messages
            .iter()
            .enumerate()
            .map(|(idx, msg)| Record {
                transactional: false,
                control: false,
                partition_leader_epoch: 0,
                producer_id: -1,
                producer_epoch: -1,
                timestamp: msg.timestamp.unwrap_or(-1),
                timestamp_type: TimestampType::Creation,
                offset: idx as i64,
                sequence: -1,
                key: msg.key.clone(),
                value: msg.value.clone(),
                headers: msg.headers.clone(),
            })
            .collect();

        // Encode the records into a batch. Varint overhead of a v2 record is at most 21 bytes.
        let size = messages.iter().fold(61usize, |acc, msg| acc + 21 + msg.payload_size() + msg.headers.len() * 8);
        let mut batch = BytesMut::with_capacity(size);
        let encode_opts = RecordEncodeOptions {
            version: 2,
            compression: self.compression,
        };
        RecordBatchEncoder::encode(&mut batch, records.iter(), &encode_opts).map_err(|err| ClientError::EncodingError(format!("{:?}", err)))?;

        // Create the request object for the broker.
        let mut req = ProduceRequest::default();
        req.acks = self.acks as i16;
        req.timeout_ms = self.timeout_ms;
        let topic_data = req.topic_data.entry(StrBytes::from_string(topic.to_string()).into()).or_default();
        let mut ptn_data = PartitionProduceData::default();
        ptn_data.index = partition;
        ptn_data.records = Some(batch.freeze());
        topic_data.partition_data.push(ptn_data);

        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::ProduceKey as i16;
        header.request_api_version = PRODUCE_API_VERSION;
        header.correlation_id = CORRELATION_ID;
        header.client_id = self.client_id.clone();

        encode_request(&header, &req)
    }
}

/// Encode the length delimiter, header & body of a produce request into a single frame.
fn encode_request(header: &RequestHeader, req: &ProduceRequest) -> Result<Bytes, ClientError> {
    let header_version = ApiKey::ProduceKey.request_header_version(header.request_api_version);
    let header_size = header
        .compute_size(header_version)
        .map_err(|err| ClientError::EncodingError(format!("error computing encoding size of request header: {:?}", err)))?;
    let body_size = req
        .compute_size(header.request_api_version)
        .map_err(|err| ClientError::EncodingError(format!("error computing encoding size of request body: {:?}", err)))?;
    let request_size = header_size + body_size;
    let length = frame_length(request_size)?;

    let mut dst = BytesMut::with_capacity(4 + request_size);
    dst.put_i32(length);
    header
        .encode(&mut dst, header_version)
        .map_err(|err| ClientError::EncodingError(format!("error encoding request header: {:?}", err)))?;
    req.encode(&mut dst, header.request_api_version)
        .map_err(|err| ClientError::EncodingError(format!("error encoding request body: {:?}", err)))?;
    Ok(dst.freeze())
}

/// The length delimiter of a request of the given size, which must fit in an `i32`.
fn frame_length(request_size: usize) -> Result<i32, ClientError> {
    i32::try_from(request_size).map_err(|_| ClientError::EncodingError(format!("request of {} bytes exceeds the max frame length of {} bytes", request_size, i32::MAX)))
}
