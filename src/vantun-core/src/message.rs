//! Control messages and their wire framing.
//!
//! Every control and telemetry exchange uses the same envelope: a 4-byte
//! big-endian length prefix followed by that many bytes of CBOR. Messages are
//! capped at 1 MiB; a larger prefix is rejected before any allocation.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::MAX_MESSAGE_SIZE;

/// Control message kinds exchanged during session negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    /// Sent by the client to initiate a session
    SessionInit,
    /// Sent by the server to accept or reject a session
    SessionAccept,
    /// Sent as the first message on a stream to identify its kind
    StreamType,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::SessionInit => 0x01,
            MessageType::SessionAccept => 0x02,
            MessageType::StreamType => 0x03,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            0x01 => Ok(MessageType::SessionInit),
            0x02 => Ok(MessageType::SessionAccept),
            0x03 => Ok(MessageType::StreamType),
            other => Err(format!("unknown message type {other:#04x}")),
        }
    }
}

/// A control message: a type tag plus a CBOR-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message kind
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// CBOR-encoded payload matching the kind
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Message {
    /// Build a message from a serializable payload.
    pub fn new<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self {
            msg_type,
            data: encode_payload(payload)?,
        })
    }
}

/// Payload for SessionInit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInitPayload {
    /// Protocol version
    pub version: u16,
    /// Optional authentication token (placeholder, unused)
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
    /// Features the client supports
    pub supported_features: Vec<String>,
}

/// Payload for SessionAccept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAcceptPayload {
    /// Whether the session was accepted
    pub accepted: bool,
    /// Reason for rejection, empty on accept
    pub reason: String,
    /// Features the server supports
    pub server_features: Vec<String>,
}

/// Payload for StreamType.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamTypePayload {
    /// Stream kind tag (see [`crate::streams::StreamKind`])
    pub kind: u8,
}

/// Encode a payload to CBOR bytes.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(payload, &mut buf)
        .map_err(|e| Error::Codec(format!("cbor encode: {e}")))?;
    Ok(buf)
}

/// Decode a payload from CBOR bytes.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data).map_err(|e| Error::Codec(format!("cbor decode: {e}")))
}

/// Write a length-prefixed CBOR frame: 4-byte big-endian length, then body.
pub async fn write_frame<W>(stream: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Codec(format!(
            "message too large: {} bytes",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame body.
///
/// A stream that ends mid-prefix or mid-payload surfaces as an I/O error;
/// an out-of-range prefix is a codec error, rejected before allocation.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(Error::Codec(format!("message length out of range: {len}")));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// Write a length-prefixed message to the stream.
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = encode_payload(msg)?;
    write_frame(stream, &data).await
}

/// Read a length-prefixed message from the stream.
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let data = read_frame(stream).await?;
    decode_payload(&data)
}
