//! Transport capability traits and the quinn adapter.
//!
//! The core never names quinn types directly: sessions, multipath and the
//! pool all work against [`TunnelConnection`] / [`TunnelStream`], which carry
//! exactly the capability set the protocol needs. This keeps the in-memory
//! test transport trivial and the QUIC dependency at the edge.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;

/// Counters a transport may expose for telemetry sampling.
///
/// Everything is cumulative since the connection opened; samplers take
/// deltas between ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Bytes handed to the wire
    pub bytes_sent: u64,
    /// Bytes received from the wire
    pub bytes_received: u64,
    /// Packets sent on the current path
    pub packets_sent: u64,
    /// Packets declared lost on the current path
    pub packets_lost: u64,
    /// Current congestion window in bytes
    pub congestion_window: u64,
}

/// A bidirectional, in-order byte stream over the tunnel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Transport-assigned stream identifier.
    fn id(&self) -> u64;
}

/// One connection to a peer, capable of opening and accepting streams.
#[async_trait]
pub trait TunnelConnection: Send + Sync {
    /// Open a new bidirectional stream.
    async fn open_stream(&self) -> Result<Box<dyn TunnelStream>>;

    /// Accept the next stream opened by the peer.
    async fn accept_stream(&self) -> Result<Box<dyn TunnelStream>>;

    /// Close the connection with an application error code and reason.
    fn close(&self, code: u32, reason: &[u8]);

    /// Whether the connection has been closed (locally or by the peer).
    fn is_closed(&self) -> bool;

    /// Local endpoint address, when known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address, when known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Current round-trip estimate, when the transport measures one.
    fn rtt(&self) -> Option<Duration> {
        None
    }

    /// Live counters, when the transport exposes them.
    fn stats(&self) -> Option<TransportStats> {
        None
    }
}

/// QUIC connection adapter over quinn.
pub struct QuicConnection {
    conn: quinn::Connection,
    local_addr: Option<SocketAddr>,
}

impl QuicConnection {
    /// Wrap an established quinn connection.
    pub fn new(conn: quinn::Connection, local_addr: Option<SocketAddr>) -> Self {
        Self { conn, local_addr }
    }

    /// Access the underlying quinn connection.
    pub fn inner(&self) -> &quinn::Connection {
        &self.conn
    }
}

#[async_trait]
impl TunnelConnection for QuicConnection {
    async fn open_stream(&self) -> Result<Box<dyn TunnelStream>> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|e| io::Error::other(e))?;
        Ok(Box::new(QuicBiStream::new(send, recv)))
    }

    async fn accept_stream(&self) -> Result<Box<dyn TunnelStream>> {
        let (send, recv) = self
            .conn
            .accept_bi()
            .await
            .map_err(|e| io::Error::other(e))?;
        Ok(Box::new(QuicBiStream::new(send, recv)))
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.conn.close(quinn::VarInt::from_u32(code), reason);
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    fn rtt(&self) -> Option<Duration> {
        Some(self.conn.rtt())
    }

    fn stats(&self) -> Option<TransportStats> {
        let stats = self.conn.stats();
        Some(TransportStats {
            bytes_sent: stats.udp_tx.bytes,
            bytes_received: stats.udp_rx.bytes,
            packets_sent: stats.path.sent_packets,
            packets_lost: stats.path.lost_packets,
            congestion_window: stats.path.cwnd,
        })
    }
}

/// Bidirectional QUIC stream adapter.
///
/// Fuses quinn's separate send and receive halves into a single
/// AsyncRead + AsyncWrite value so protocol code sees one stream.
pub struct QuicBiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl QuicBiStream {
    /// Combine send/recv halves into one stream.
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self { send, recv }
    }

    /// Split back into the underlying halves.
    pub fn into_parts(self) -> (quinn::SendStream, quinn::RecvStream) {
        (self.send, self.recv)
    }
}

impl AsyncRead for QuicBiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.send).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.send).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.send).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl TunnelStream for QuicBiStream {
    fn id(&self) -> u64 {
        self.send.id().index()
    }
}
