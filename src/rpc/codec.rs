//! Pluggable message codecs.
//!
//! A codec owns one transport stream and turns [`Message`]s into frames on
//! it. Payloads are encoded and decoded separately from the envelope so the
//! server can defer request decoding until it knows the target method.
//!
//! The reference codec, [`JsonCodec`], writes one JSON object per message,
//! each terminated by a newline. On the read side frames are delimited by the
//! object boundaries alone, so objects written back-to-back or spread over
//! several lines are accepted too:
//!
//! ```text
//! {"method":"Arith.Double","content":{"value":21}}
//! {"method":"Arith.Double","content":{"value":42}}
//! {"method":"Arith.Divide","err":"divide by zero"}
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use super::protocol::{Message, RawPayload};
use crate::error::{Error, Result};

/// Serializes and deserializes messages over one transport stream.
#[async_trait]
pub trait Codec: Send + 'static {
    /// Write one full message.
    ///
    /// Either the whole frame is written or an error is returned, after which
    /// the stream must be considered compromised.
    async fn send(&mut self, message: &Message) -> Result<()>;

    /// Block until one full message has been read.
    ///
    /// The content is handed back undecoded. Fails with a decode error on a
    /// malformed envelope and with [`Error::ConnectionClosed`] on EOF between
    /// messages.
    async fn recv(&mut self) -> Result<Message>;

    /// Close the underlying stream.
    async fn shutdown(&mut self) -> Result<()>;

    /// Encode a typed value into this codec's payload representation.
    fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<RawPayload>
    where
        Self: Sized;

    /// Decode a previously captured payload into a typed value. An absent
    /// payload decodes the same way an explicit null would.
    fn parse_raw<T: DeserializeOwned>(raw: Option<&RawPayload>) -> Result<T>
    where
        Self: Sized;
}

/// Builds a server-side codec for every accepted connection.
pub trait CodecFactory: Send + Sync + 'static {
    type Codec: Codec;

    fn build(&self, stream: TcpStream) -> Self::Codec;
}

/// Factory for [`JsonCodec`], the default server codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodecFactory;

impl CodecFactory for JsonCodecFactory {
    type Codec = JsonCodec<TcpStream>;

    fn build(&self, stream: TcpStream) -> Self::Codec {
        JsonCodec::new(stream)
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "str::is_empty")]
    err: &'a str,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(default)]
    method: String,
    #[serde(default)]
    content: Option<Box<RawValue>>,
    #[serde(default)]
    err: String,
}

/// Largest frame [`JsonCodec`] buffers before giving up, unless changed with
/// [`JsonCodec::max_frame_len`].
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Streaming JSON codec over any async byte stream.
pub struct JsonCodec<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    /// Bytes read but not yet decoded.
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl<S> JsonCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            buf: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Fail with [`Error::Protocol`] once an incomplete frame grows past
    /// `max_frame_len` bytes.
    pub fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

/// Decode the first envelope in `buf`. `None` means more bytes are needed.
fn decode_envelope(buf: &[u8]) -> Result<Option<(IncomingEnvelope, usize)>> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<IncomingEnvelope>();
    match stream.next() {
        Some(Ok(envelope)) => Ok(Some((envelope, stream.byte_offset()))),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

fn to_raw_value(raw: &RawPayload) -> Result<Box<RawValue>> {
    let text = String::from_utf8(raw.as_bytes().to_vec())
        .map_err(|e| Error::Protocol(format!("payload is not UTF-8: {}", e)))?;
    Ok(RawValue::from_string(text)?)
}

#[async_trait]
impl<S> Codec for JsonCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, message: &Message) -> Result<()> {
        let content = match message.payload() {
            Some(raw) => Some(to_raw_value(raw)?),
            None => None,
        };

        let envelope = OutgoingEnvelope {
            method: &message.method,
            content: content.as_deref(),
            err: &message.err,
        };

        let mut frame = serde_json::to_vec(&envelope)?;
        frame.push(b'\n');

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message> {
        loop {
            let leading = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buf.drain(..leading);

            if let Some((envelope, consumed)) = decode_envelope(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(Message {
                    method: envelope.method,
                    content: envelope
                        .content
                        .map(|raw| RawPayload::new(raw.get().as_bytes().to_vec())),
                    err: envelope.err,
                });
            }

            if self.buf.len() >= self.max_frame_len {
                return Err(Error::Protocol(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_len
                )));
            }

            self.buf.reserve(READ_CHUNK);
            let bytes_read = self.reader.read_buf(&mut self.buf).await?;

            if bytes_read == 0 {
                if self.buf.is_empty() {
                    return Err(Error::ConnectionClosed);
                }
                return Err(Error::Protocol("stream ended inside a frame".to_string()));
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<RawPayload> {
        Ok(RawPayload::new(serde_json::to_vec(value)?))
    }

    fn parse_raw<T: DeserializeOwned>(raw: Option<&RawPayload>) -> Result<T> {
        let bytes = raw.map_or(b"null".as_slice(), RawPayload::as_bytes);
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, duplex};

    type DuplexCodec = JsonCodec<tokio::io::DuplexStream>;

    #[tokio::test]
    async fn test_send_then_recv_over_duplex() {
        let (a, b) = duplex(4096);
        let mut client = JsonCodec::new(a);
        let mut server = JsonCodec::new(b);

        let content = DuplexCodec::encode_payload(&json!({"value": 21})).unwrap();
        client
            .send(&Message::request("Arith.Double", content))
            .await
            .unwrap();

        let received = server.recv().await.unwrap();
        assert_eq!(received.method, "Arith.Double");
        assert!(received.err.is_empty());

        let value: serde_json::Value = DuplexCodec::parse_raw(received.content.as_ref()).unwrap();
        assert_eq!(value, json!({"value": 21}));
    }

    #[tokio::test]
    async fn test_error_response_omits_content() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        codec
            .send(&Message::failure("Arith.Divide", "divide by zero"))
            .await
            .unwrap();
        codec.shutdown().await.unwrap();

        let mut wire = String::new();
        b.read_to_string(&mut wire).await.unwrap();

        assert_eq!(
            wire,
            "{\"method\":\"Arith.Divide\",\"err\":\"divide by zero\"}\n"
        );
    }

    #[tokio::test]
    async fn test_recv_keeps_payload_raw() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        b.write_all(b"\n{\"method\":\"Foo.Bar\",\"content\":{\"nested\":[1, 2]}}\n")
            .await
            .unwrap();

        let msg = codec.recv().await.unwrap();
        assert_eq!(msg.method, "Foo.Bar");
        assert_eq!(
            msg.content.unwrap().as_bytes(),
            b"{\"nested\":[1, 2]}".as_slice()
        );
    }

    #[tokio::test]
    async fn test_recv_back_to_back_objects() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        b.write_all(b"{\"method\":\"Foo.Bar\",\"content\":1}{\"method\":\"Foo.Baz\",\"content\":2}\n")
            .await
            .unwrap();

        let first = codec.recv().await.unwrap();
        assert_eq!(first.method, "Foo.Bar");
        assert_eq!(first.content.unwrap().as_bytes(), b"1".as_slice());

        let second = codec.recv().await.unwrap();
        assert_eq!(second.method, "Foo.Baz");
        assert_eq!(second.content.unwrap().as_bytes(), b"2".as_slice());
    }

    #[tokio::test]
    async fn test_recv_object_spread_over_lines() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        b.write_all(b"{\n  \"method\": \"Foo.Bar\",\n  \"content\": 1\n}\n")
            .await
            .unwrap();

        let msg = codec.recv().await.unwrap();
        assert_eq!(msg.method, "Foo.Bar");
        assert_eq!(msg.content.unwrap().as_bytes(), b"1".as_slice());
    }

    #[tokio::test]
    async fn test_recv_object_split_across_writes() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        let writer = tokio::spawn(async move {
            b.write_all(b"{\"method\":\"Foo.").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            // No trailing newline: the closing brace alone ends the frame.
            b.write_all(b"Bar\",\"content\":3}").await.unwrap();
            b
        });

        let msg = codec.recv().await.unwrap();
        assert_eq!(msg.method, "Foo.Bar");
        assert_eq!(msg.content.unwrap().as_bytes(), b"3".as_slice());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a).max_frame_len(64);

        let mut frame = b"{\"method\":\"".to_vec();
        frame.extend(std::iter::repeat_n(b'x', 256));
        b.write_all(&frame).await.unwrap();

        assert!(matches!(codec.recv().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_protocol_error() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        b.write_all(b"{\"method\":\"Foo").await.unwrap();
        drop(b);

        assert!(matches!(codec.recv().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_recv_without_content() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        b.write_all(b"{\"method\":\"Foo.Bar\",\"content\":null}\n")
            .await
            .unwrap();

        let msg = codec.recv().await.unwrap();
        assert!(msg.content.is_none());

        let _: () = DuplexCodec::parse_raw(msg.content.as_ref()).unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_decode_error() {
        let (a, mut b) = duplex(4096);
        let mut codec = JsonCodec::new(a);

        b.write_all(b"{not json}\n").await.unwrap();

        assert!(matches!(codec.recv().await, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, b) = duplex(4096);
        let mut codec = JsonCodec::new(a);
        drop(b);

        assert!(matches!(codec.recv().await, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_parse_raw_rejects_wrong_shape() {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[allow(dead_code)]
            value: i64,
        }

        let raw = RawPayload::new(b"{\"value\":\"nope\"}".to_vec());
        assert!(DuplexCodec::parse_raw::<Args>(Some(&raw)).is_err());
        assert!(DuplexCodec::parse_raw::<Args>(None).is_err());
    }
}
