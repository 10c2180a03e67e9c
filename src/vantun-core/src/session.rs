//! Session lifecycle and the control-stream handshake.
//!
//! A session is a handle over one tunnel connection. The client dials, sends
//! `SessionInit{version}` on the first bidirectional stream and expects
//! `SessionAccept{accepted: true}` back; the server validates the version and
//! always answers, including an explicit rejection before closing on
//! mismatch. After the handshake the client opens (and the server accepts) a
//! telemetry stream; failure there degrades the session to non-adaptive
//! operation instead of killing it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::{
    decode_payload, read_message, write_message, Message, MessageType, SessionAcceptPayload,
    SessionInitPayload,
};
use crate::streams::{open_typed, read_stream_kind, StreamKind};
use crate::telemetry::{ConnectionSampler, TelemetryManager};
use crate::tls::build_client_endpoint;
use crate::transport::{QuicConnection, TunnelConnection, TunnelStream};
use crate::PROTOCOL_VERSION;

/// Default handshake deadline when the caller supplies none.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between telemetry samples.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Client-side session parameters.
#[derive(Clone)]
pub struct SessionConfig {
    /// Server address, `host:port`
    pub address: String,
    /// TLS server name for certificate verification
    pub server_name: String,
    /// QUIC client configuration (TLS policy, ALPN, transport tuning)
    pub client: quinn::ClientConfig,
    /// Deadline for dial + handshake
    pub handshake_timeout: Duration,
}

impl SessionConfig {
    /// Config with the default server name and handshake timeout.
    pub fn new(address: impl Into<String>, client: quinn::ClientConfig) -> Self {
        Self {
            address: address.into(),
            server_name: "localhost".into(),
            client,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing on the wire yet
    New,
    /// Control-stream negotiation in progress
    Handshaking,
    /// Streams may be opened and accepted
    Active,
    /// Teardown started
    Closing,
    /// Terminal; all operations fail with ClosedSession
    Closed,
}

/// A VANTUN session over one tunnel connection.
pub struct Session {
    conn: Arc<dyn TunnelConnection>,
    telemetry: tokio::sync::Mutex<Option<TelemetryManager>>,
    state: Mutex<SessionState>,
    // Streams accepted ahead of their consumer (e.g. an application stream
    // arriving where the telemetry stream was expected); drained first by
    // accept_any.
    stashed: tokio::sync::Mutex<VecDeque<(StreamKind, Box<dyn TunnelStream>)>>,
}

impl Session {
    /// Dial a server and establish a session.
    pub async fn connect(config: &SessionConfig) -> Result<Session> {
        let conn = tokio::time::timeout(config.handshake_timeout, dial(config))
            .await
            .map_err(|_| Error::Handshake("dial timed out".into()))??;
        tokio::time::timeout(
            config.handshake_timeout,
            Session::client_with_connection(conn),
        )
        .await
        .map_err(|_| Error::Handshake("handshake timed out".into()))?
    }

    fn over(conn: Arc<dyn TunnelConnection>) -> Session {
        Session {
            conn,
            telemetry: tokio::sync::Mutex::new(None),
            state: Mutex::new(SessionState::New),
            stashed: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Run the client handshake over an established connection.
    pub async fn client_with_connection(conn: Arc<dyn TunnelConnection>) -> Result<Session> {
        let session = Session::over(conn.clone());
        session.set_state(SessionState::Handshaking);

        if let Err(e) = client_handshake(conn.as_ref()).await {
            conn.close(0, b"handshake failed");
            session.set_state(SessionState::Closed);
            return Err(e);
        }
        session.set_state(SessionState::Active);
        info!(peer = ?conn.remote_addr(), "session established");

        // Telemetry is best-effort; the session runs without adaptation if
        // the stream cannot be opened.
        match open_typed(conn.as_ref(), StreamKind::Telemetry).await {
            Ok(stream) => {
                let sampler = Arc::new(ConnectionSampler::new(conn.clone()));
                let manager = TelemetryManager::reporter(stream, sampler, TELEMETRY_INTERVAL);
                *session.telemetry.lock().await = Some(manager);
            }
            Err(e) => warn!(error = %e, "failed to open telemetry stream"),
        }

        Ok(session)
    }

    /// Run the server handshake over an accepted connection.
    ///
    /// The first accepted stream is expected to be the client's telemetry
    /// stream; a client that opens an application stream first (multipath
    /// paths do) gets that stream stashed for the next accept instead of
    /// losing it.
    pub async fn server_with_connection(conn: Arc<dyn TunnelConnection>) -> Result<Session> {
        let session = Session::over(conn.clone());
        session.set_state(SessionState::Handshaking);

        if let Err(e) = server_handshake(conn.as_ref()).await {
            conn.close(0, b"handshake failed");
            session.set_state(SessionState::Closed);
            return Err(e);
        }
        session.set_state(SessionState::Active);
        info!(peer = ?conn.remote_addr(), "session accepted");

        match session.accept_any().await {
            Ok((StreamKind::Telemetry, stream)) => {
                *session.telemetry.lock().await = Some(TelemetryManager::receiver(stream));
            }
            Ok((kind, stream)) => {
                debug!(%kind, "first stream is not telemetry, stashing it");
                session.stashed.lock().await.push_back((kind, stream));
            }
            Err(e) => warn!(error = %e, "failed to accept telemetry stream"),
        }

        Ok(session)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    /// The underlying connection.
    pub fn connection(&self) -> Arc<dyn TunnelConnection> {
        self.conn.clone()
    }

    /// Latest telemetry sample received from the peer, when this side
    /// accepted the telemetry stream.
    pub async fn peer_telemetry(&self) -> Option<crate::telemetry::TelemetryData> {
        self.telemetry
            .lock()
            .await
            .as_ref()
            .and_then(|m| m.latest_remote())
    }

    /// Open a stream tagged with `kind`.
    pub async fn open_typed(&self, kind: StreamKind) -> Result<Box<dyn TunnelStream>> {
        self.ensure_active()?;
        open_typed(self.conn.as_ref(), kind).await
    }

    /// Accept the next typed stream, whatever its kind.
    pub async fn accept_any(&self) -> Result<(StreamKind, Box<dyn TunnelStream>)> {
        self.ensure_active()?;
        if let Some(entry) = self.stashed.lock().await.pop_front() {
            return Ok(entry);
        }
        let mut stream = self.conn.accept_stream().await?;
        match read_stream_kind(&mut stream).await {
            Ok(kind) => Ok((kind, stream)),
            Err(e) => {
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Accept a stream, requiring the tag `kind`.
    pub async fn accept_typed(&self, kind: StreamKind) -> Result<Box<dyn TunnelStream>> {
        let (got, mut stream) = self.accept_any().await?;
        if got != kind {
            let _ = stream.shutdown().await;
            return Err(Error::Protocol(format!(
                "expected {kind} stream, peer opened {got}"
            )));
        }
        Ok(stream)
    }

    /// Open an interactive stream.
    pub async fn open_interactive(&self) -> Result<Box<dyn TunnelStream>> {
        self.open_typed(StreamKind::Interactive).await
    }

    /// Accept an interactive stream.
    pub async fn accept_interactive(&self) -> Result<Box<dyn TunnelStream>> {
        self.accept_typed(StreamKind::Interactive).await
    }

    /// Open a bulk stream.
    pub async fn open_bulk(&self) -> Result<Box<dyn TunnelStream>> {
        self.open_typed(StreamKind::Bulk).await
    }

    /// Accept a bulk stream.
    pub async fn accept_bulk(&self) -> Result<Box<dyn TunnelStream>> {
        self.accept_typed(StreamKind::Bulk).await
    }

    /// Close the session: stop telemetry, then close the connection.
    ///
    /// Idempotent; later calls are no-ops.
    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        if let Some(manager) = self.telemetry.lock().await.take() {
            manager.stop().await;
        }
        self.conn.close(0, reason.as_bytes());
        self.set_state(SessionState::Closed);
        debug!("session closed");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state() != SessionState::Active || self.conn.is_closed() {
            return Err(Error::ClosedSession);
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
    }
}

/// Dial and handshake without building a session.
///
/// Multipath paths and pooled connections manage their own lifecycle and
/// telemetry; they only need an authenticated connection.
pub(crate) async fn connect_raw(config: &SessionConfig) -> Result<Arc<dyn TunnelConnection>> {
    let conn = tokio::time::timeout(config.handshake_timeout, dial(config))
        .await
        .map_err(|_| Error::Handshake("dial timed out".into()))??;
    match tokio::time::timeout(config.handshake_timeout, client_handshake(conn.as_ref())).await {
        Ok(Ok(())) => Ok(conn),
        Ok(Err(e)) => {
            conn.close(0, b"handshake failed");
            Err(e)
        }
        Err(_) => {
            conn.close(0, b"handshake timed out");
            Err(Error::Handshake("handshake timed out".into()))
        }
    }
}

async fn dial(config: &SessionConfig) -> Result<Arc<dyn TunnelConnection>> {
    let endpoint = build_client_endpoint(config.client.clone())?;
    let local_addr = endpoint.local_addr().ok();
    let addr = tokio::net::lookup_host(config.address.as_str())
        .await?
        .next()
        .ok_or_else(|| Error::ConfigInvalid(format!("cannot resolve {}", config.address)))?;
    let conn = endpoint
        .connect(addr, &config.server_name)
        .map_err(|e| Error::Handshake(format!("connect to {addr}: {e}")))?
        .await
        .map_err(|e| Error::Handshake(format!("quic handshake with {addr}: {e}")))?;
    Ok(Arc::new(QuicConnection::new(conn, local_addr)))
}

async fn client_handshake(conn: &dyn TunnelConnection) -> Result<()> {
    let mut stream = conn.open_stream().await?;

    let init = SessionInitPayload {
        version: PROTOCOL_VERSION,
        token: Vec::new(),
        supported_features: Vec::new(),
    };
    write_message(&mut stream, &Message::new(MessageType::SessionInit, &init)?).await?;

    let reply = read_message(&mut stream).await?;
    if reply.msg_type != MessageType::SessionAccept {
        return Err(Error::Handshake(format!(
            "expected SessionAccept, got {:?}",
            reply.msg_type
        )));
    }
    let accept: SessionAcceptPayload = decode_payload(&reply.data)?;
    if !accept.accepted {
        return Err(Error::Handshake(format!(
            "server rejected session: {}",
            accept.reason
        )));
    }

    let _ = stream.shutdown().await;
    debug!("client handshake complete");
    Ok(())
}

async fn server_handshake(conn: &dyn TunnelConnection) -> Result<()> {
    let mut stream = conn.accept_stream().await?;

    let msg = read_message(&mut stream).await?;
    if msg.msg_type != MessageType::SessionInit {
        return Err(Error::Handshake(format!(
            "expected SessionInit, got {:?}",
            msg.msg_type
        )));
    }
    let init: SessionInitPayload = decode_payload(&msg.data)?;
    debug!(
        version = init.version,
        features = ?init.supported_features,
        "received SessionInit"
    );

    if init.version != PROTOCOL_VERSION {
        // The peer still gets an explicit rejection before the close.
        let reject = SessionAcceptPayload {
            accepted: false,
            reason: format!("unsupported protocol version {}", init.version),
            server_features: Vec::new(),
        };
        let msg = Message::new(MessageType::SessionAccept, &reject)?;
        let _ = write_message(&mut stream, &msg).await;
        let _ = stream.shutdown().await;
        return Err(Error::Handshake(format!(
            "unsupported protocol version {}",
            init.version
        )));
    }

    let accept = SessionAcceptPayload {
        accepted: true,
        reason: String::new(),
        server_features: Vec::new(),
    };
    write_message(&mut stream, &Message::new(MessageType::SessionAccept, &accept)?).await?;
    debug!("server handshake complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryConnection;

    async fn establish() -> (Session, Session) {
        let (client_conn, server_conn) = MemoryConnection::pair();
        let (client, server) = tokio::join!(
            Session::client_with_connection(Arc::new(client_conn)),
            Session::server_with_connection(Arc::new(server_conn)),
        );
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn handshake_activates_both_sides() {
        let (client, server) = establish().await;
        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(server.state(), SessionState::Active);
        client.close("test done").await;
        server.close("test done").await;
    }

    #[tokio::test]
    async fn echo_over_interactive_stream() {
        let (client, server) = establish().await;

        let (opened, accepted) =
            tokio::join!(client.open_interactive(), server.accept_interactive());
        let mut opened = opened.unwrap();
        let mut accepted = accepted.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let payload = b"Hello from VANTUN client!";
        opened.write_all(payload).await.unwrap();
        opened.flush().await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        accepted.read_exact(&mut buf).await.unwrap();
        accepted.write_all(&buf).await.unwrap();
        accepted.flush().await.unwrap();

        let mut echo = vec![0u8; payload.len()];
        opened.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, payload);

        client.close("done").await;
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let (client, _server) = establish().await;
        client.close("first").await;
        client.close("second").await;
        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(
            client.open_interactive().await,
            Err(Error::ClosedSession)
        ));
    }

    #[tokio::test]
    async fn bulk_streams_carry_data() {
        let (client, server) = establish().await;
        let (opened, accepted) = tokio::join!(client.open_bulk(), server.accept_bulk());
        let mut opened = opened.unwrap();
        let mut accepted = accepted.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let blob = vec![0x5au8; 2048];
        opened.write_all(&blob).await.unwrap();
        opened.flush().await.unwrap();
        let mut received = vec![0u8; blob.len()];
        accepted.read_exact(&mut received).await.unwrap();
        assert_eq!(received, blob);

        client.close("done").await;
    }

    #[tokio::test]
    async fn typed_mismatch_rejected_on_acceptor() {
        let (client, server) = establish().await;
        let (opened, accepted) = tokio::join!(
            client.open_typed(StreamKind::Interactive),
            server.accept_typed(StreamKind::Bulk),
        );
        assert!(opened.is_ok());
        assert!(matches!(accepted, Err(Error::Protocol(_))));
        client.close("done").await;
    }
}
