//! Reusable client connection pool.
//!
//! Connections are keyed by address and reused most-recent-first. A borrowed
//! connection belongs to the caller until it is returned; streams opened
//! through [`PooledSession`] return their connection automatically when the
//! stream shuts down (or is dropped), exactly once. Pooled connections whose
//! transport has died are discarded on checkout instead of being handed back
//! out.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::Result;
use crate::session::{connect_raw, SessionConfig};
use crate::streams::{open_typed, StreamKind};
use crate::transport::{TunnelConnection, TunnelStream};

struct AddrPool {
    connections: Mutex<Vec<Arc<dyn TunnelConnection>>>,
}

/// Pool of authenticated client connections, keyed by address.
pub struct ConnectionPool {
    // Template for new dials; cloned per connection, never mutated.
    config: SessionConfig,
    pools: RwLock<HashMap<String, Arc<AddrPool>>>,
    max_pool_size: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool dialing with `config` as the template.
    pub fn new(config: SessionConfig, max_pool_size: usize, idle_timeout: Duration) -> Self {
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
            max_pool_size,
            idle_timeout,
        }
    }

    /// Idle timeout pooled connections are expected to survive.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Borrow a connection to `address`, dialing when none is pooled.
    ///
    /// Ownership transfers to the caller until
    /// [`return_connection`](Self::return_connection).
    pub async fn get_connection(&self, address: &str) -> Result<Arc<dyn TunnelConnection>> {
        let pool = self.pool_for(address);

        // Most recent first; drop anything that died while idle.
        loop {
            let candidate = pool
                .connections
                .lock()
                .expect("address pool poisoned")
                .pop();
            match candidate {
                Some(conn) if conn.is_closed() => {
                    debug!(address, "discarding dead pooled connection");
                }
                Some(conn) => return Ok(conn),
                None => break,
            }
        }

        let config = SessionConfig {
            address: address.to_string(),
            ..self.config.clone()
        };
        connect_raw(&config).await
    }

    /// Give a borrowed connection back; closes it when the pool is full.
    pub fn return_connection(&self, address: &str, conn: Arc<dyn TunnelConnection>) {
        if conn.is_closed() {
            return;
        }
        let pool = self.pool_for(address);
        let mut connections = pool.connections.lock().expect("address pool poisoned");
        if connections.len() >= self.max_pool_size {
            drop(connections);
            conn.close(0, b"pool full");
            return;
        }
        connections.push(conn);
    }

    /// Close every idle connection and clear the pool.
    pub fn close(&self) {
        let mut pools = self.pools.write().expect("pool map poisoned");
        for pool in pools.values() {
            let mut connections = pool.connections.lock().expect("address pool poisoned");
            for conn in connections.drain(..) {
                conn.close(0, b"pool closed");
            }
        }
        pools.clear();
    }

    fn pool_for(&self, address: &str) -> Arc<AddrPool> {
        if let Some(pool) = self.pools.read().expect("pool map poisoned").get(address) {
            return pool.clone();
        }
        self.pools
            .write()
            .expect("pool map poisoned")
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(AddrPool {
                    connections: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }
}

/// Session-like facade that opens streams over pooled connections.
pub struct PooledSession {
    pool: Arc<ConnectionPool>,
}

impl PooledSession {
    /// Wrap a pool.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Open an interactive stream to `address` on a pooled connection.
    ///
    /// The returned stream gives its connection back to the pool when shut
    /// down or dropped.
    pub async fn open_interactive_stream(&self, address: &str) -> Result<PooledStream> {
        let conn = self.pool.get_connection(address).await?;
        match open_typed(conn.as_ref(), StreamKind::Interactive).await {
            Ok(stream) => Ok(PooledStream {
                stream,
                lease: Some(Lease {
                    pool: self.pool.clone(),
                    address: address.to_string(),
                    conn,
                }),
            }),
            Err(e) => {
                self.pool.return_connection(address, conn);
                Err(e)
            }
        }
    }
}

struct Lease {
    pool: Arc<ConnectionPool>,
    address: String,
    conn: Arc<dyn TunnelConnection>,
}

impl Lease {
    fn release(self) {
        self.pool.return_connection(&self.address, self.conn);
    }
}

/// Stream whose shutdown returns its connection to the pool exactly once.
pub struct PooledStream {
    stream: Box<dyn TunnelStream>,
    lease: Option<Lease>,
}

impl PooledStream {
    /// Whether the connection has already been returned.
    pub fn returned(&self) -> bool {
        self.lease.is_none()
    }
}

impl AsyncRead for PooledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.stream).poll_shutdown(cx);
        if let Poll::Ready(_) = &result {
            if let Some(lease) = self.lease.take() {
                lease.release();
            }
        }
        result
    }
}

impl TunnelStream for PooledStream {
    fn id(&self) -> u64 {
        self.stream.id()
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        // A stream dropped without shutdown still returns its connection.
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}
