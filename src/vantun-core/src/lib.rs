//! # VANTUN Core
//!
//! Adaptive tunneling datapath over QUIC: a session/stream multiplexing
//! protocol with a telemetry→control feedback loop driving forward error
//! correction and a token-bucket rate limiter, optional multipath spreading,
//! and an HTTP/3-lookalike obfuscation layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Application                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Session (handshake, typed streams)   Multipath (N paths)    │
//! │        │                                  │                  │
//! │  Obfuscation wrapper (fake HTTP/3 DATA+PADDING frames)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Telemetry ──▶ Rate controller ──▶ Token bucket              │
//! │      │                └──────────▶ Adaptive FEC (k, m±2)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Transport traits (TunnelConnection / TunnelStream)          │
//! │        quinn (QUIC + rustls, ALPN "vantun")   in-memory mock │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The control stream carries length-prefixed CBOR messages; every typed
//! stream announces its kind as the first message; a dedicated telemetry
//! stream feeds the peer a sample per second.

/// Telemetry-driven parity shard adjustment
pub mod adaptive;
/// Token bucket rate limiter
pub mod bucket;
/// JSON configuration with hot reload
pub mod config;
/// Typed error taxonomy
pub mod error;
/// Reed-Solomon FEC codec with encoder caching
pub mod fec;
/// Control message types and length-prefixed CBOR framing
pub mod message;
/// In-memory transport for tests
pub mod mock;
/// Multipath scheduling across peer paths
pub mod multipath;
/// HTTP/3-lookalike obfuscation
pub mod obfs;
/// Reusable client connection pool
pub mod pool;
/// Telemetry-driven rate controller loop
pub mod rate;
/// Server accept loop and stream handlers
pub mod server;
/// Session lifecycle and handshake
pub mod session;
/// Typed stream open/accept
pub mod streams;
/// Telemetry sampling, reporting and management
pub mod telemetry;
/// TLS and QUIC endpoint configuration
pub mod tls;
/// Transport capability traits and the quinn adapter
pub mod transport;
/// HTTP/3 variable-length integers
pub mod varint;

pub use error::{Error, Result};

/// Protocol version sent in SessionInit
pub const PROTOCOL_VERSION: u16 = 1;

/// ALPN identifier for VANTUN connections
pub const ALPN: &[u8] = b"vantun";

/// Maximum control/telemetry message size on the wire (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
