//! Telemetry sampling, reporting and reception.
//!
//! A sampler snapshots connection health once per tick; the reporter ships
//! samples to the peer over the telemetry stream as length-prefixed CBOR.
//! Sampling is an extension point: transports that expose live counters get
//! real deltas, everything else falls back to the stub's fixed placeholders.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::Result;
use crate::message::{decode_payload, encode_payload, read_frame, write_frame};
use crate::transport::{TransportStats, TunnelConnection, TunnelStream};

/// One snapshot of connection health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    /// Round-trip time
    #[serde(with = "duration_nanos")]
    pub rtt: Duration,
    /// Packet loss rate in [0, 1]
    pub loss: f64,
    /// Estimated bandwidth, bytes per second
    pub bandwidth: u64,
    /// When the sample was taken
    #[serde(with = "unix_millis")]
    pub timestamp: SystemTime,
    /// Congestion window, bytes
    pub cwnd: u64,
    /// Bytes currently in flight
    pub bytes_in_flight: u64,
    /// Estimated delivery rate, bytes per second
    pub delivery_rate: u64,
}

mod duration_nanos {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

mod unix_millis {
    use super::SystemTime;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        s.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        Ok(UNIX_EPOCH + Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Source of telemetry samples.
pub trait TelemetrySampler: Send + Sync {
    /// Take a snapshot of current connection health.
    fn sample(&self) -> TelemetryData;
}

/// Sampler returning fixed placeholder values.
///
/// Used when the transport exposes no statistics; the constants match the
/// defaults real links are assumed to start from.
pub struct StubSampler;

impl TelemetrySampler for StubSampler {
    fn sample(&self) -> TelemetryData {
        TelemetryData {
            rtt: Duration::from_millis(50),
            loss: 0.01,
            bandwidth: 1_000_000,
            timestamp: SystemTime::now(),
            cwnd: 10_000,
            bytes_in_flight: 1_000,
            delivery_rate: 1_000_000,
        }
    }
}

struct SamplerWindow {
    at: Instant,
    stats: TransportStats,
    peak_delivery: u64,
}

/// Sampler that derives live metrics from transport counters.
///
/// Loss comes from packet-count deltas, delivery rate from byte deltas per
/// tick, and bandwidth tracks the highest delivery rate observed. When the
/// transport exposes no counters the stub placeholders are reported with the
/// transport's RTT estimate folded in if available.
pub struct ConnectionSampler {
    conn: Arc<dyn TunnelConnection>,
    window: Mutex<SamplerWindow>,
}

impl ConnectionSampler {
    /// Sample from `conn`'s counters.
    pub fn new(conn: Arc<dyn TunnelConnection>) -> Self {
        let stats = conn.stats().unwrap_or_default();
        Self {
            conn,
            window: Mutex::new(SamplerWindow {
                at: Instant::now(),
                stats,
                peak_delivery: 0,
            }),
        }
    }
}

impl TelemetrySampler for ConnectionSampler {
    fn sample(&self) -> TelemetryData {
        let mut base = StubSampler.sample();
        if let Some(rtt) = self.conn.rtt() {
            base.rtt = rtt;
        }
        let Some(stats) = self.conn.stats() else {
            return base;
        };

        let mut window = self.window.lock().expect("sampler window poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(window.at).as_secs_f64().max(0.001);

        let sent = stats.packets_sent.saturating_sub(window.stats.packets_sent);
        let lost = stats.packets_lost.saturating_sub(window.stats.packets_lost);
        if sent > 0 {
            base.loss = (lost as f64 / sent as f64).clamp(0.0, 1.0);
        }

        let bytes = stats.bytes_sent.saturating_sub(window.stats.bytes_sent);
        let delivery = (bytes as f64 / elapsed) as u64;
        if delivery > 0 {
            base.delivery_rate = delivery;
        }
        window.peak_delivery = window.peak_delivery.max(delivery);
        if window.peak_delivery > 0 {
            base.bandwidth = window.peak_delivery;
        }
        base.cwnd = stats.congestion_window;

        window.at = now;
        window.stats = stats;
        base
    }
}

/// Writes telemetry samples to the telemetry stream.
pub struct TelemetryReporter {
    stream: Box<dyn TunnelStream>,
}

impl TelemetryReporter {
    /// Report over `stream`.
    pub fn new(stream: Box<dyn TunnelStream>) -> Self {
        Self { stream }
    }

    /// Send one sample: 4-byte big-endian length, then CBOR.
    pub async fn report(&mut self, data: &TelemetryData) -> Result<()> {
        let body = encode_payload(data)?;
        write_frame(&mut self.stream, &body).await
    }
}

/// Reads telemetry samples from the telemetry stream.
pub struct TelemetryReceiver {
    stream: Box<dyn TunnelStream>,
}

impl TelemetryReceiver {
    /// Receive from `stream`.
    pub fn new(stream: Box<dyn TunnelStream>) -> Self {
        Self { stream }
    }

    /// Read the next sample.
    pub async fn recv(&mut self) -> Result<TelemetryData> {
        let body = read_frame(&mut self.stream).await?;
        decode_payload(&body)
    }
}

/// Owns the per-session telemetry task.
///
/// The endpoint that opened the telemetry stream samples and reports on it;
/// the accepting endpoint receives the peer's samples. Stop signals the task
/// and joins it.
pub struct TelemetryManager {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    latest_remote: watch::Receiver<Option<TelemetryData>>,
}

impl TelemetryManager {
    /// Start a sample-and-report loop on an opened telemetry stream.
    pub fn reporter(
        stream: Box<dyn TunnelStream>,
        sampler: Arc<dyn TelemetrySampler>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let (_, latest_remote) = watch::channel(None);
        let mut reporter = TelemetryReporter::new(stream);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so samples are spaced.
            ticker.tick().await;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => continue,
                    _ = ticker.tick() => {
                        let data = sampler.sample();
                        trace!(
                            rtt_ms = data.rtt.as_millis() as u64,
                            loss = data.loss,
                            bandwidth = data.bandwidth,
                            "reporting telemetry"
                        );
                        if let Err(e) = reporter.report(&data).await {
                            warn!(error = %e, "failed to report telemetry");
                        }
                    }
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
            latest_remote,
        }
    }

    /// Start a receive loop on an accepted telemetry stream.
    pub fn receiver(stream: Box<dyn TunnelStream>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let (latest_tx, latest_remote) = watch::channel(None);
        let mut receiver = TelemetryReceiver::new(stream);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|s| *s) => break,
                    sample = receiver.recv() => match sample {
                        Ok(data) => {
                            trace!(
                                rtt_ms = data.rtt.as_millis() as u64,
                                loss = data.loss,
                                "peer telemetry"
                            );
                            let _ = latest_tx.send(Some(data));
                        }
                        Err(_) => break,
                    },
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
            latest_remote,
        }
    }

    /// Most recent sample received from the peer, if this side receives.
    pub fn latest_remote(&self) -> Option<TelemetryData> {
        self.latest_remote.borrow().clone()
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
