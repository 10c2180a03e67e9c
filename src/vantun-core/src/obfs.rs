//! HTTP/3-lookalike obfuscation.
//!
//! Payload bytes are reshaped into a sequence of fake HTTP/3 frames: each
//! 1024-byte chunk becomes a DATA frame (`0x00 || varint(len) || chunk`),
//! followed 40% of the time by a PADDING frame of random bytes. The decoder
//! extracts DATA payloads and skips every other frame type unconditionally,
//! so the byte stream survives arbitrary padding placement. The wire image
//! is randomized and therefore not a stable bijection; only the recovered
//! payload is.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::streams::StreamKind;
use crate::transport::TunnelStream;
use crate::varint::{read_varint, write_varint};

/// DATA frame type carrying payload bytes.
pub const FRAME_DATA: u8 = 0x00;
/// PADDING frame type, skipped on decode.
pub const FRAME_PADDING: u8 = 0x01;

/// Payload bytes per DATA frame.
const CHUNK_SIZE: usize = 1024;
/// Chance of a PADDING frame following a DATA frame.
const PADDING_PROBABILITY: f64 = 0.4;
/// Raw read granularity for the stream wrapper.
const READ_CHUNK: usize = 4096;

/// Obfuscation settings for a session.
#[derive(Debug, Clone)]
pub struct ObfuscationConfig {
    /// Whether streams are wrapped at all
    pub enabled: bool,
    /// Frame types available to the encoder; an extension hook, decode
    /// skips every non-DATA type regardless
    pub frame_types: Vec<u8>,
    /// Minimum padding frame payload
    pub min_padding: usize,
    /// Maximum padding frame payload
    pub max_padding: usize,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frame_types: (0x00..=0x07).collect(),
            min_padding: 0,
            max_padding: 100,
        }
    }
}

/// Reshapes a byte stream into fake HTTP/3 frames and back.
pub struct Http3Obfuscator {
    frame_types: Vec<u8>,
    min_padding: usize,
    max_padding: usize,
    rng: StdRng,
}

impl Http3Obfuscator {
    /// Create an obfuscator.
    ///
    /// An empty frame-type set falls back to the default 0x00..=0x07; a max
    /// padding below the min is lifted to min + 100.
    pub fn new(frame_types: Vec<u8>, min_padding: usize, max_padding: usize) -> Self {
        Self::with_rng(frame_types, min_padding, max_padding, StdRng::from_entropy())
    }

    /// Create with a seeded RNG for reproducible padding.
    pub fn seeded(frame_types: Vec<u8>, min_padding: usize, max_padding: usize, seed: u64) -> Self {
        Self::with_rng(
            frame_types,
            min_padding,
            max_padding,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(frame_types: Vec<u8>, min_padding: usize, max_padding: usize, rng: StdRng) -> Self {
        let frame_types = if frame_types.is_empty() {
            (0x00..=0x07).collect()
        } else {
            frame_types
        };
        let max_padding = if max_padding < min_padding {
            min_padding + 100
        } else {
            max_padding
        };
        Self {
            frame_types,
            min_padding,
            max_padding,
            rng,
        }
    }

    /// Build an obfuscator from a session-level config.
    pub fn from_config(config: &ObfuscationConfig) -> Self {
        Self::new(
            config.frame_types.clone(),
            config.min_padding,
            config.max_padding,
        )
    }

    /// Frame types this obfuscator advertises.
    ///
    /// An extension hook for future frame variants; decode does not consult
    /// it, every non-DATA type is skipped.
    pub fn frame_types(&self) -> &[u8] {
        &self.frame_types
    }

    /// Encode payload bytes into a frame sequence.
    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + data.len() / CHUNK_SIZE * 4 + 8);
        for chunk in data.chunks(CHUNK_SIZE) {
            out.push(FRAME_DATA);
            write_varint(&mut out, chunk.len() as u64)?;
            out.extend_from_slice(chunk);

            if self.rng.gen_bool(PADDING_PROBABILITY) {
                let pad_len = self.rng.gen_range(self.min_padding..=self.max_padding);
                out.push(FRAME_PADDING);
                write_varint(&mut out, pad_len as u64)?;
                let start = out.len();
                out.resize(start + pad_len, 0);
                self.rng.fill(&mut out[start..]);
            }
        }
        Ok(out)
    }

    /// Decode a complete frame sequence back into payload bytes.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        let mut cursor = data;
        while cursor.has_remaining() {
            match parse_frame(&mut cursor) {
                FrameParse::Data(payload) => out.extend_from_slice(payload),
                FrameParse::Skipped => {}
                FrameParse::Incomplete => {
                    return Err(Error::Codec("truncated obfuscation frame".into()))
                }
            }
        }
        Ok(out)
    }
}

enum FrameParse<'a> {
    Data(&'a [u8]),
    Skipped,
    Incomplete,
}

// Parse one frame from the front of `cursor`, consuming it only when the
// frame is complete. Every non-DATA frame type is skipped.
fn parse_frame<'a>(cursor: &mut &'a [u8]) -> FrameParse<'a> {
    let saved = *cursor;
    let frame_type = cursor.get_u8();
    let len = match read_varint(cursor) {
        Ok(len) => len as usize,
        Err(_) => {
            *cursor = saved;
            return FrameParse::Incomplete;
        }
    };
    if cursor.remaining() < len {
        *cursor = saved;
        return FrameParse::Incomplete;
    }
    if frame_type == FRAME_DATA {
        let payload = &cursor[..len];
        cursor.advance(len);
        FrameParse::Data(payload)
    } else {
        cursor.advance(len);
        FrameParse::Skipped
    }
}

/// Stream adapter that obfuscates writes and deobfuscates reads.
///
/// Writes report the unencoded byte count even though more bytes flow on the
/// wire. Reads parse frames incrementally, tolerating frames that span
/// transport read boundaries; a stream ending mid-frame is an error.
pub struct ObfuscatedStream {
    inner: Box<dyn TunnelStream>,
    obfs: Http3Obfuscator,
    // Write side: encoded bytes not yet accepted by the inner stream, and
    // the caller-visible length to report once they all are.
    pending: BytesMut,
    claimed: Option<usize>,
    // Read side: undecoded wire bytes and decoded payload ready to serve.
    raw: BytesMut,
    decoded: BytesMut,
    eof: bool,
}

impl ObfuscatedStream {
    /// Wrap a stream with an obfuscator.
    pub fn new(inner: Box<dyn TunnelStream>, obfs: Http3Obfuscator) -> Self {
        Self {
            inner,
            obfs,
            pending: BytesMut::new(),
            claimed: None,
            raw: BytesMut::new(),
            decoded: BytesMut::new(),
            eof: false,
        }
    }

    // Move complete frames from `raw` into `decoded`.
    fn drain_raw(&mut self) {
        loop {
            if self.raw.is_empty() {
                return;
            }
            let mut cursor = &self.raw[..];
            match parse_frame(&mut cursor) {
                FrameParse::Data(payload) => {
                    self.decoded.extend_from_slice(payload);
                }
                FrameParse::Skipped => {}
                FrameParse::Incomplete => return,
            }
            let consumed = self.raw.len() - cursor.len();
            self.raw.advance(consumed);
        }
    }

    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(n)) => {
                    self.pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ObfuscatedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(buf.remaining());
                buf.put_slice(&this.decoded[..n]);
                this.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                if !this.raw.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an obfuscation frame",
                    )));
                }
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; READ_CHUNK];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        this.eof = true;
                    } else {
                        this.raw.extend_from_slice(filled);
                        this.drain_raw();
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ObfuscatedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.claimed.is_none() {
            let encoded = this.obfs.encode(buf).map_err(Error::into_io)?;
            this.pending.extend_from_slice(&encoded);
            this.claimed = Some(buf.len());
        }
        match this.poll_write_pending(cx) {
            Poll::Ready(Ok(())) => {
                let n = this.claimed.take().expect("claimed length set above");
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_write_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_write_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

impl TunnelStream for ObfuscatedStream {
    fn id(&self) -> u64 {
        self.inner.id()
    }
}

/// Session wrapper whose streams carry obfuscated traffic.
pub struct ObfuscatedSession {
    session: Session,
    config: ObfuscationConfig,
}

impl ObfuscatedSession {
    /// Wrap a session with obfuscation settings.
    pub fn new(session: Session, config: ObfuscationConfig) -> Self {
        Self { session, config }
    }

    /// The wrapped session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Open a typed stream, wrapped when obfuscation is enabled.
    pub async fn open_stream(&self, kind: StreamKind) -> Result<Box<dyn TunnelStream>> {
        let stream = self.session.open_typed(kind).await?;
        Ok(self.wrap(stream))
    }

    /// Accept a typed stream, wrapped when obfuscation is enabled.
    pub async fn accept_stream(&self, kind: StreamKind) -> Result<Box<dyn TunnelStream>> {
        let stream = self.session.accept_typed(kind).await?;
        Ok(self.wrap(stream))
    }

    /// Close the wrapped session.
    pub async fn close(&self, reason: &str) {
        self.session.close(reason).await;
    }

    fn wrap(&self, stream: Box<dyn TunnelStream>) -> Box<dyn TunnelStream> {
        if !self.config.enabled {
            return stream;
        }
        Box::new(ObfuscatedStream::new(
            stream,
            Http3Obfuscator::from_config(&self.config),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn payloads() -> Vec<Vec<u8>> {
        [0usize, 1, 14, 2048]
            .iter()
            .map(|&len| (0..len).map(|i| (i * 7 % 256) as u8).collect())
            .collect()
    }

    #[test]
    fn round_trip_all_sizes() {
        let mut obfs = Http3Obfuscator::new(vec![0x00, 0x01, 0x02], 10, 100);
        for payload in payloads() {
            let encoded = obfs.encode(&payload).unwrap();
            let decoded = obfs.decode(&encoded).unwrap();
            assert_eq!(decoded, payload, "len {}", payload.len());
        }
    }

    #[test]
    fn encoding_grows_nonempty_input() {
        let mut obfs = Http3Obfuscator::seeded(vec![0x00, 0x01], 10, 100, 7);
        for payload in payloads().into_iter().filter(|p| !p.is_empty()) {
            let encoded = obfs.encode(&payload).unwrap();
            assert!(encoded.len() > payload.len());
        }
    }

    #[test]
    fn padding_appears_with_forced_rng() {
        // Seed chosen arbitrarily; over 64 chunks padding is all but certain,
        // and the amount is bounded by the configured range.
        let mut obfs = Http3Obfuscator::seeded(vec![0x00, 0x01], 10, 10, 42);
        let payload = vec![0xab; CHUNK_SIZE * 64];
        let encoded = obfs.encode(&payload).unwrap();
        let padding_frames = encoded
            .len()
            .checked_sub(payload.len() + 64 * 3)
            .expect("headers accounted");
        assert!(padding_frames > 0, "no padding emitted across 64 chunks");
        assert_eq!(padding_frames % 12, 0, "each padding frame is 2 + 10 bytes");
        assert_eq!(obfs.decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn decode_skips_every_non_data_type() {
        let obfs = Http3Obfuscator::new(vec![0x00, 0x01, 0x02], 0, 10);

        let mut wire = Vec::new();
        wire.push(FRAME_DATA);
        write_varint(&mut wire, 2).unwrap();
        wire.extend_from_slice(b"hi");
        wire.push(0x02);
        write_varint(&mut wire, 3).unwrap();
        wire.extend_from_slice(&[9, 9, 9]);
        assert_eq!(obfs.decode(&wire).unwrap(), b"hi");

        // Even a type outside the advertised set is skipped, not rejected.
        wire.push(0x05);
        write_varint(&mut wire, 1).unwrap();
        wire.push(0);
        assert_eq!(obfs.decode(&wire).unwrap(), b"hi");
        assert_eq!(obfs.frame_types(), &[0x00, 0x01, 0x02]);
    }

    #[test]
    fn decode_rejects_truncation_inside_a_frame() {
        let obfs = Http3Obfuscator::new(vec![0x00, 0x01], 5, 20);

        // DATA(5 bytes) then PADDING(3 bytes); frames end at offsets 7 and 12.
        let mut wire = Vec::new();
        wire.push(FRAME_DATA);
        write_varint(&mut wire, 5).unwrap();
        wire.extend_from_slice(&[1, 2, 3, 4, 5]);
        wire.push(FRAME_PADDING);
        write_varint(&mut wire, 3).unwrap();
        wire.extend_from_slice(&[9, 9, 9]);
        assert_eq!(wire.len(), 12);

        for cut in 1..wire.len() {
            if cut == 7 {
                // A cut on the frame boundary is a complete, shorter stream.
                assert_eq!(obfs.decode(&wire[..cut]).unwrap(), &[1, 2, 3, 4, 5]);
                continue;
            }
            assert!(
                obfs.decode(&wire[..cut]).is_err(),
                "cut at {cut} decoded cleanly"
            );
        }
    }

    #[tokio::test]
    async fn stream_wrapper_round_trips() {
        let (a, b) = MemoryStream::pair(4);
        let mut writer = ObfuscatedStream::new(
            Box::new(a),
            Http3Obfuscator::new(vec![0x00, 0x01], 5, 30),
        );
        let mut reader = ObfuscatedStream::new(
            Box::new(b),
            Http3Obfuscator::new(vec![0x00, 0x01], 5, 30),
        );

        let payload: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let n = writer.write(&payload).await.unwrap();
        assert_eq!(n, payload.len(), "caller sees the unencoded count");
        writer.flush().await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn stream_wrapper_handles_interleaved_writes() {
        let (a, b) = MemoryStream::pair(6);
        let mut writer =
            ObfuscatedStream::new(Box::new(a), Http3Obfuscator::new(vec![0x00, 0x01], 0, 10));
        let mut reader =
            ObfuscatedStream::new(Box::new(b), Http3Obfuscator::new(vec![0x00, 0x01], 0, 10));

        writer.write_all(b"first ").await.unwrap();
        writer.write_all(b"second").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 12];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first second");
    }
}
