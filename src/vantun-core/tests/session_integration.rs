//! End-to-end tests over real QUIC on ephemeral localhost ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use vantun_core::message::{
    decode_payload, read_message, write_message, Message, MessageType, SessionAcceptPayload,
    SessionInitPayload,
};
use vantun_core::multipath::MultipathSession;
use vantun_core::obfs::{ObfuscatedSession, ObfuscationConfig};
use vantun_core::server::Server;
use vantun_core::session::{Session, SessionConfig, SessionState};
use vantun_core::streams::StreamKind;
use vantun_core::tls::{
    build_client_config, build_client_endpoint, build_server_config, generate_self_signed,
    ClientVerification,
};
use vantun_core::transport::QuicBiStream;

fn start_server(obfs: bool) -> (Arc<Server>, SocketAddr) {
    let (certs, key) = generate_self_signed(&["localhost"]).unwrap();
    let config = build_server_config(certs, key).unwrap();
    let server = Arc::new(
        Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            config,
            ObfuscationConfig {
                enabled: obfs,
                ..ObfuscationConfig::default()
            },
        )
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (server, addr)
}

fn client_config(addr: SocketAddr) -> SessionConfig {
    let client = build_client_config(&ClientVerification::Insecure).unwrap();
    SessionConfig::new(addr.to_string(), client)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_activates_within_two_seconds() {
    let (server, addr) = start_server(false);

    let session = timeout(Duration::from_secs(2), Session::connect(&client_config(addr)))
        .await
        .expect("handshake deadline")
        .expect("handshake");
    assert_eq!(session.state(), SessionState::Active);

    session.close("test complete").await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interactive_stream_echoes_exactly() {
    let (server, addr) = start_server(false);
    let session = Session::connect(&client_config(addr)).await.unwrap();

    let mut stream = session.open_interactive().await.unwrap();
    let payload = b"Hello from VANTUN client!";
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut echo = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut echo))
        .await
        .expect("echo deadline")
        .expect("echo read");
    assert_eq!(&echo, payload);

    session.close("test complete").await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn obfuscated_stream_echoes_exactly() {
    let (server, addr) = start_server(true);
    let session = Session::connect(&client_config(addr)).await.unwrap();
    let session = ObfuscatedSession::new(
        session,
        ObfuscationConfig {
            enabled: true,
            ..ObfuscationConfig::default()
        },
    );

    let mut stream = session.open_stream(StreamKind::Interactive).await.unwrap();
    let payload: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    stream.write_all(&payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut echo = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut echo))
        .await
        .expect("echo deadline")
        .expect("echo read");
    assert_eq!(echo, payload);

    session.close("test complete").await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multipath_stream_echoes_over_primary_path() {
    let (server, addr) = start_server(false);

    let multipath = MultipathSession::new(client_config(addr), None, None);
    multipath.add_path(&addr.to_string()).await.unwrap();

    let mut stream = multipath.open_stream().await.unwrap();
    let payload = b"Hello from VANTUN multipath client!";
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut echo = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut echo))
        .await
        .expect("echo deadline")
        .expect("echo read");
    assert_eq!(&echo, payload);

    multipath.close().await;
    server.shutdown().await;
}

// The server's first bytes on the control stream must parse as a framed
// SessionAccept, and a version it does not speak must be rejected with a
// reason before the close.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn control_stream_replies_with_framed_session_accept() {
    let (server, addr) = start_server(false);

    let endpoint =
        build_client_endpoint(build_client_config(&ClientVerification::Insecure).unwrap()).unwrap();
    let conn = endpoint
        .connect(addr, "localhost")
        .unwrap()
        .await
        .expect("quic connect");

    let (send, recv) = conn.open_bi().await.unwrap();
    let mut control = QuicBiStream::new(send, recv);

    let init = SessionInitPayload {
        version: 99,
        token: Vec::new(),
        supported_features: Vec::new(),
    };
    write_message(
        &mut control,
        &Message::new(MessageType::SessionInit, &init).unwrap(),
    )
    .await
    .unwrap();

    let reply = timeout(Duration::from_secs(2), read_message(&mut control))
        .await
        .expect("reply deadline")
        .expect("reply parses as a framed message");
    assert_eq!(reply.msg_type, MessageType::SessionAccept);
    let accept: SessionAcceptPayload = decode_payload(&reply.data).unwrap();
    assert!(!accept.accepted);
    assert!(
        accept.reason.contains("version"),
        "reason was {:?}",
        accept.reason
    );

    conn.close(quinn::VarInt::from_u32(0), b"done");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_survives_many_sequential_streams() {
    let (server, addr) = start_server(false);
    let session = Session::connect(&client_config(addr)).await.unwrap();

    for round in 0..5u8 {
        let mut stream = session.open_interactive().await.unwrap();
        let payload = vec![round; 64];
        stream.write_all(&payload).await.unwrap();
        stream.flush().await.unwrap();
        let mut echo = vec![0u8; payload.len()];
        timeout(Duration::from_secs(2), stream.read_exact(&mut echo))
            .await
            .expect("echo deadline")
            .expect("echo read");
        assert_eq!(echo, payload);
        stream.shutdown().await.unwrap();
    }

    session.close("test complete").await;
    server.shutdown().await;
}
