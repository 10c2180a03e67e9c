//! Server accept loop.
//!
//! Each accepted connection gets its own task: handshake, telemetry stream,
//! then a stream-accept loop that echoes interactive and bulk streams back
//! to the sender. Shutdown closes the endpoint and gives connection tasks a
//! short grace period to drain.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::obfs::{Http3Obfuscator, ObfuscatedStream, ObfuscationConfig};
use crate::session::Session;
use crate::streams::StreamKind;
use crate::telemetry::TelemetryReceiver;
use crate::tls::build_server_endpoint;
use crate::transport::{QuicConnection, TunnelStream};

/// Grace period for connection tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// QUIC server: accepts sessions and echoes their streams.
pub struct Server {
    endpoint: quinn::Endpoint,
    obfs: ObfuscationConfig,
    shutdown: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Server {
    /// Bind a server endpoint on `addr`.
    pub fn bind(
        addr: SocketAddr,
        config: quinn::ServerConfig,
        obfs: ObfuscationConfig,
    ) -> Result<Server> {
        let endpoint = build_server_endpoint(addr, config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            endpoint,
            obfs,
            shutdown,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The bound address, useful with an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "server listening");
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    let obfs = self.obfs.clone();
                    let local_addr = self.endpoint.local_addr().ok();
                    let conn_shutdown = self.shutdown.subscribe();
                    let handle = tokio::spawn(async move {
                        match incoming.await {
                            Ok(conn) => {
                                handle_connection(conn, local_addr, obfs, conn_shutdown).await;
                            }
                            Err(e) => warn!(error = %e, "failed to accept connection"),
                        }
                    });
                    self.tasks.lock().expect("task list poisoned").push(handle);
                }
            }
        }
        Ok(())
    }

    /// Stop accepting, close the endpoint, and drain connection tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.endpoint.close(quinn::VarInt::from_u32(0), b"server shutdown");
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("connection task did not drain within grace period");
            }
        }
    }
}

async fn handle_connection(
    conn: quinn::Connection,
    local_addr: Option<SocketAddr>,
    obfs: ObfuscationConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = conn.remote_address();
    let conn = Arc::new(QuicConnection::new(conn, local_addr));
    let session = match Session::server_with_connection(conn).await {
        Ok(session) => session,
        Err(e) => {
            error!(%peer, error = %e, "handshake failed");
            return;
        }
    };

    loop {
        if *shutdown.borrow() {
            session.close("server shutting down").await;
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            accepted = session.accept_any() => {
                match accepted {
                    Ok((StreamKind::Interactive, stream)) | Ok((StreamKind::Bulk, stream)) => {
                        let stream = wrap_stream(stream, &obfs);
                        tokio::spawn(echo_stream(stream));
                    }
                    Ok((StreamKind::Telemetry, stream)) => {
                        tokio::spawn(drain_telemetry(stream));
                    }
                    Err(e) => {
                        if session.connection().is_closed()
                            || matches!(e, crate::error::Error::ClosedSession)
                        {
                            debug!(%peer, error = %e, "connection finished");
                            session.close("connection finished").await;
                            break;
                        }
                        // An untyped or garbled stream is that stream's
                        // problem, not the connection's.
                        warn!(%peer, error = %e, "rejecting untyped stream");
                    }
                }
            }
        }
    }
}

fn wrap_stream(stream: Box<dyn TunnelStream>, obfs: &ObfuscationConfig) -> Box<dyn TunnelStream> {
    if !obfs.enabled {
        return stream;
    }
    Box::new(ObfuscatedStream::new(
        stream,
        Http3Obfuscator::from_config(obfs),
    ))
}

/// Echo everything read on `stream` back to the sender.
async fn echo_stream(mut stream: Box<dyn TunnelStream>) {
    debug!(id = stream.id(), "echoing stream");
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    debug!(error = %e, "echo write failed");
                    break;
                }
                if let Err(e) = stream.flush().await {
                    debug!(error = %e, "echo flush failed");
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "echo read finished");
                break;
            }
        }
    }
    let _ = stream.shutdown().await;
    debug!("stream echo complete");
}

// Additional telemetry streams beyond the session's own get drained so the
// peer never blocks on flow control.
async fn drain_telemetry(stream: Box<dyn TunnelStream>) {
    let mut receiver = TelemetryReceiver::new(stream);
    while let Ok(sample) = receiver.recv().await {
        debug!(
            rtt_ms = sample.rtt.as_millis() as u64,
            loss = sample.loss,
            "telemetry from peer"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryStream;

    #[tokio::test]
    async fn echo_returns_bytes_verbatim() {
        let (local, remote) = MemoryStream::pair(8);
        let echo = tokio::spawn(echo_stream(Box::new(remote)));

        let mut local = Box::new(local);
        local.write_all(b"Hello from VANTUN client!").await.unwrap();
        local.flush().await.unwrap();

        let mut buf = [0u8; 25];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello from VANTUN client!");

        local.shutdown().await.unwrap();
        drop(local);
        echo.await.unwrap();
    }
}
