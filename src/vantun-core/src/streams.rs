//! Typed streams.
//!
//! Every application stream announces its kind as the first message it
//! carries; the acceptor verifies the tag and rejects mismatches by closing
//! the stream. A stream's kind never changes after open.

use std::fmt;

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::message::{
    decode_payload, read_message, write_message, Message, MessageType, StreamTypePayload,
};
use crate::transport::{TunnelConnection, TunnelStream};

/// Roles a stream can be opened as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Latency-sensitive application data
    Interactive,
    /// Bulk transfer data
    Bulk,
    /// Telemetry samples
    Telemetry,
}

impl StreamKind {
    /// Wire tag for this kind.
    pub fn as_u8(self) -> u8 {
        match self {
            StreamKind::Interactive => 1,
            StreamKind::Bulk => 2,
            StreamKind::Telemetry => 3,
        }
    }

    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Option<StreamKind> {
        match tag {
            1 => Some(StreamKind::Interactive),
            2 => Some(StreamKind::Bulk),
            3 => Some(StreamKind::Telemetry),
            _ => None,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Interactive => write!(f, "interactive"),
            StreamKind::Bulk => write!(f, "bulk"),
            StreamKind::Telemetry => write!(f, "telemetry"),
        }
    }
}

/// Open a stream on `conn` and tag it with `kind`.
pub async fn open_typed(
    conn: &dyn TunnelConnection,
    kind: StreamKind,
) -> Result<Box<dyn TunnelStream>> {
    let mut stream = conn.open_stream().await?;
    let msg = Message::new(
        MessageType::StreamType,
        &StreamTypePayload { kind: kind.as_u8() },
    )?;
    if let Err(e) = write_message(&mut stream, &msg).await {
        let _ = stream.shutdown().await;
        return Err(e);
    }
    Ok(stream)
}

/// Accept the next stream on `conn`, requiring it to be tagged `kind`.
///
/// A stream whose first message is not a matching StreamType tag is closed
/// and the call fails with a protocol error.
pub async fn accept_typed(
    conn: &dyn TunnelConnection,
    kind: StreamKind,
) -> Result<Box<dyn TunnelStream>> {
    let mut stream = conn.accept_stream().await?;
    match read_stream_kind(&mut stream).await {
        Ok(got) if got == kind => Ok(stream),
        Ok(got) => {
            let _ = stream.shutdown().await;
            Err(Error::Protocol(format!(
                "expected {kind} stream, peer opened {got}"
            )))
        }
        Err(e) => {
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

/// Read and validate the StreamType message that must lead a typed stream.
pub async fn read_stream_kind(stream: &mut Box<dyn TunnelStream>) -> Result<StreamKind> {
    let msg = read_message(stream).await?;
    if msg.msg_type != MessageType::StreamType {
        return Err(Error::Protocol(format!(
            "expected StreamType message, got {:?}",
            msg.msg_type
        )));
    }
    let payload: StreamTypePayload = decode_payload(&msg.data)?;
    StreamKind::from_u8(payload.kind)
        .ok_or_else(|| Error::Protocol(format!("unknown stream kind tag {}", payload.kind)))
}
