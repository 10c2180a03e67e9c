//! In-memory transport for tests.
//!
//! [`MemoryConnection::pair`] yields two connected endpoints; streams opened
//! on one side appear in the peer's accept queue, backed by
//! `tokio::io::duplex` pipes. Closing either side closes the pair, which
//! matches how a QUIC close reaches both endpoints.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{Error, Result};
use crate::transport::{TunnelConnection, TunnelStream};

const STREAM_BUFFER: usize = 256 * 1024;

/// One half of an in-memory bidirectional stream.
pub struct MemoryStream {
    io: DuplexStream,
    id: u64,
}

impl MemoryStream {
    /// Create a connected stream pair sharing an id.
    pub fn pair(id: u64) -> (MemoryStream, MemoryStream) {
        let (a, b) = tokio::io::duplex(STREAM_BUFFER);
        (MemoryStream { io: a, id }, MemoryStream { io: b, id })
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl TunnelStream for MemoryStream {
    fn id(&self) -> u64 {
        self.id
    }
}

/// One endpoint of an in-memory connection pair.
pub struct MemoryConnection {
    to_peer: mpsc::UnboundedSender<MemoryStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    next_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryConnection {
    /// Create two connected endpoints.
    ///
    /// Streams get QUIC-style alternating ids: the first endpoint opens even
    /// ids, the second odd.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let a = MemoryConnection {
            to_peer: b_tx,
            incoming: Mutex::new(a_rx),
            next_id: AtomicU64::new(0),
            closed_tx: closed_tx.clone(),
            closed_rx: closed_rx.clone(),
        };
        let b = MemoryConnection {
            to_peer: a_tx,
            incoming: Mutex::new(b_rx),
            next_id: AtomicU64::new(1),
            closed_tx,
            closed_rx,
        };
        (a, b)
    }
}

#[async_trait]
impl TunnelConnection for MemoryConnection {
    async fn open_stream(&self) -> Result<Box<dyn TunnelStream>> {
        if self.is_closed() {
            return Err(Error::ClosedSession);
        }
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (local, remote) = MemoryStream::pair(id);
        self.to_peer
            .send(remote)
            .map_err(|_| Error::ClosedSession)?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> Result<Box<dyn TunnelStream>> {
        let mut closed = self.closed_rx.clone();
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => match stream {
                Some(s) => Ok(Box::new(s) as Box<dyn TunnelStream>),
                None => Err(Error::ClosedSession),
            },
            _ = closed.wait_for(|c| *c) => Err(Error::ClosedSession),
        }
    }

    fn close(&self, _code: u32, _reason: &[u8]) {
        let _ = self.closed_tx.send(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn streams_cross_the_pair() {
        let (client, server) = MemoryConnection::pair();

        let mut opened = client.open_stream().await.unwrap();
        let mut accepted = server.accept_stream().await.unwrap();
        assert_eq!(opened.id(), accepted.id());

        opened.write_all(b"ping").await.unwrap();
        opened.flush().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn close_propagates_to_both_sides() {
        let (client, server) = MemoryConnection::pair();
        client.close(0, b"done");
        assert!(client.is_closed());
        assert!(server.is_closed());
        assert!(matches!(
            client.open_stream().await,
            Err(Error::ClosedSession)
        ));
        assert!(matches!(
            server.accept_stream().await,
            Err(Error::ClosedSession)
        ));
    }

    #[tokio::test]
    async fn ids_alternate_by_initiator() {
        let (client, server) = MemoryConnection::pair();
        let s0 = client.open_stream().await.unwrap();
        let s1 = server.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s0.id(), 0);
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 2);
    }
}
