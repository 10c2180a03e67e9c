//! Error taxonomy for the tunneling datapath.
//!
//! Component-internal failures that do not corrupt state (telemetry report
//! errors, single-path send failures, FEC rebuild failures) are logged at the
//! call site and the loop continues; everything surfaced through this type
//! either fails the operation or tears down the session.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the VANTUN core.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying transport failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer rejected the session or replied with a malformed handshake
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Unexpected message type or mismatched stream type
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// CBOR or varint encode/decode failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Too many shards lost to reconstruct the codeword
    #[error("fec unrecoverable: {present} of {total} shards present, need {needed}")]
    FecUnrecoverable {
        /// Shards available at decode time
        present: usize,
        /// Total shard slots (k + m)
        total: usize,
        /// Minimum shards required (k)
        needed: usize,
    },

    /// Token bucket denied a required reservation
    #[error("rate limited: {requested} bytes denied")]
    RateLimited {
        /// Size of the denied reservation
        requested: usize,
    },

    /// Operation attempted on a closed session
    #[error("session closed")]
    ClosedSession,

    /// No active path remains in the multipath set
    #[error("no active path available")]
    NoActivePath,

    /// Configuration rejected during validation
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// Wrap this error as `std::io::Error` for AsyncRead/AsyncWrite surfaces.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
