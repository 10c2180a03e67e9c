//! Multipath scheduling.
//!
//! A multipath session owns one handshaked connection per peer path. Writes
//! are FEC-encoded or chunked, each chunk rides a short-lived sub-stream on a
//! path picked by the configured strategy, and a failed path is marked
//! inactive and the chunk retried elsewhere. Chunks are independent: no
//! sequence numbers and no reassembly ordering are defined here.
//!
//! Path metrics live in per-path atomics so probe tasks refresh them under
//! the path list's read lock; the round-robin cursor stays private beside
//! the list.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::adaptive::AdaptiveFec;
use crate::error::{Error, Result};
use crate::rate::RateController;
use crate::session::{connect_raw, SessionConfig};
use crate::streams::{open_typed, StreamKind};
use crate::telemetry::{ConnectionSampler, TelemetrySampler};
use crate::transport::{TunnelConnection, TunnelStream};

/// Default chunk size for non-FEC sends.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How often each path refreshes its metrics.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// One network path to the peer.
pub struct Path {
    addr: String,
    conn: Arc<dyn TunnelConnection>,
    rtt_micros: AtomicU64,
    loss_bits: AtomicU64,
    bandwidth: AtomicU64,
    active: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Path {
    fn new(addr: String, conn: Arc<dyn TunnelConnection>) -> Self {
        // Placeholder metrics until the first probe lands.
        Self {
            addr,
            conn,
            rtt_micros: AtomicU64::new(50_000),
            loss_bits: AtomicU64::new(0.01f64.to_bits()),
            bandwidth: AtomicU64::new(1_000_000),
            active: AtomicBool::new(true),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Address this path dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Last measured round-trip time.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_micros.load(Ordering::Relaxed))
    }

    /// Last measured loss rate.
    pub fn loss(&self) -> f64 {
        f64::from_bits(self.loss_bits.load(Ordering::Relaxed))
    }

    /// Last estimated bandwidth, bytes per second.
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::Relaxed)
    }

    /// Whether the path is eligible for selection.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn set_metrics(&self, rtt: Duration, loss: f64, bandwidth: u64) {
        self.rtt_micros
            .store(rtt.as_micros() as u64, Ordering::Relaxed);
        self.loss_bits.store(loss.to_bits(), Ordering::Relaxed);
        self.bandwidth.store(bandwidth, Ordering::Relaxed);
        *self.last_active.lock().expect("path timestamp poisoned") = Instant::now();
    }

    fn mark_inactive(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

/// Read-only snapshot of a path's state.
#[derive(Debug, Clone)]
pub struct PathStats {
    /// Path address
    pub addr: String,
    /// Round-trip time
    pub rtt: Duration,
    /// Loss rate
    pub loss: f64,
    /// Bandwidth estimate, bytes per second
    pub bandwidth: u64,
    /// Selection eligibility
    pub active: bool,
}

/// Strategy for picking the path a chunk rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathStrategy {
    /// Cycle through active paths in insertion order
    #[default]
    RoundRobin,
    /// Always the active path with the smallest RTT
    MinRtt,
    /// Random, weighted by bandwidth
    Weighted,
}

/// Splits payloads into bounded chunks for per-path sub-streams.
pub struct DataSplitter {
    chunk_size: usize,
}

impl DataSplitter {
    /// Splitter with the given chunk size.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Borrow `data` as ≤ chunk_size slices.
    pub fn split<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        data.chunks(self.chunk_size).collect()
    }
}

/// A session spread across multiple network paths.
pub struct MultipathSession {
    config: SessionConfig,
    paths: RwLock<Vec<Arc<Path>>>,
    cursor: Mutex<usize>,
    strategy: Mutex<PathStrategy>,
    splitter: DataSplitter,
    rate: Option<Arc<RateController>>,
    adaptive: Option<Arc<AdaptiveFec>>,
    shutdown: watch::Sender<bool>,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

impl MultipathSession {
    /// Create an empty multipath session.
    ///
    /// The rate controller, when given, has its telemetry source pointed at
    /// the first path's connection; the adaptive FEC, when given, encodes
    /// every send.
    pub fn new(
        config: SessionConfig,
        rate: Option<Arc<RateController>>,
        adaptive: Option<Arc<AdaptiveFec>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            paths: RwLock::new(Vec::new()),
            cursor: Mutex::new(0),
            strategy: Mutex::new(PathStrategy::default()),
            splitter: DataSplitter::new(DEFAULT_CHUNK_SIZE),
            rate,
            adaptive,
            shutdown,
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Dial `addr`, handshake, and register the connection as a path.
    pub async fn add_path(&self, addr: &str) -> Result<()> {
        info!(addr, "adding path");
        let config = SessionConfig {
            address: addr.to_string(),
            ..self.config.clone()
        };
        let conn = connect_raw(&config).await?;
        self.add_path_with_connection(addr, conn);
        Ok(())
    }

    /// Register an already-handshaked connection as a path.
    pub fn add_path_with_connection(&self, addr: &str, conn: Arc<dyn TunnelConnection>) {
        let path = Arc::new(Path::new(addr.to_string(), conn.clone()));

        let first = {
            let mut paths = self.paths.write().expect("path list poisoned");
            paths.push(path.clone());
            paths.len() == 1
        };

        if first {
            if let Some(rate) = &self.rate {
                rate.attach_sampler(Arc::new(ConnectionSampler::new(conn)));
                debug!(addr, "rate controller sampling the primary path");
            }
        }

        let handle = tokio::spawn(probe_path(path, self.shutdown.subscribe()));
        self.probes.lock().expect("probe list poisoned").push(handle);
    }

    /// Close and remove the path dialed to `addr`.
    pub fn remove_path(&self, addr: &str) -> Result<()> {
        let mut paths = self.paths.write().expect("path list poisoned");
        let index = paths
            .iter()
            .position(|p| p.addr == addr)
            .ok_or_else(|| Error::ConfigInvalid(format!("path {addr} not found")))?;
        let path = paths.remove(index);
        path.mark_inactive();
        path.conn.close(0, b"path removed");
        Ok(())
    }

    /// Change the selection strategy.
    pub fn set_strategy(&self, strategy: PathStrategy) {
        *self.strategy.lock().expect("strategy poisoned") = strategy;
    }

    /// Snapshot every path's metrics.
    pub fn path_stats(&self) -> Vec<PathStats> {
        self.paths
            .read()
            .expect("path list poisoned")
            .iter()
            .map(|p| PathStats {
                addr: p.addr.clone(),
                rtt: p.rtt(),
                loss: p.loss(),
                bandwidth: p.bandwidth(),
                active: p.is_active(),
            })
            .collect()
    }

    /// Open an interactive stream on the selected path.
    pub async fn open_stream(&self) -> Result<Box<dyn TunnelStream>> {
        let path = self.select_path().ok_or(Error::NoActivePath)?;
        debug!(path = %path.addr, "opening stream");
        open_typed(path.conn.as_ref(), StreamKind::Interactive).await
    }

    /// Accept a stream from the first active path.
    pub async fn accept_stream(&self) -> Result<Box<dyn TunnelStream>> {
        let path = {
            let paths = self.paths.read().expect("path list poisoned");
            paths.iter().find(|p| p.is_active()).cloned()
        }
        .ok_or(Error::NoActivePath)?;
        path.conn.accept_stream().await
    }

    /// Send `data` across the path set.
    ///
    /// Reserves the payload size from the token bucket when a rate
    /// controller is attached, FEC-encodes when adaptive FEC is present
    /// (plain chunking otherwise), and retries each chunk on the remaining
    /// active paths after a failure.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        if let Some(rate) = &self.rate {
            if !rate.bucket().consume(data.len() as f64) {
                return Err(Error::RateLimited {
                    requested: data.len(),
                });
            }
        }

        let chunks: Vec<Vec<u8>> = match &self.adaptive {
            Some(fec) => {
                let shards = fec.encode(data)?;
                debug!(shards = shards.len(), "fec-encoded payload");
                shards
            }
            None => self
                .splitter
                .split(data)
                .into_iter()
                .map(<[u8]>::to_vec)
                .collect(),
        };

        for (index, chunk) in chunks.iter().enumerate() {
            loop {
                let path = self.select_path().ok_or(Error::NoActivePath)?;
                match send_chunk(path.as_ref(), chunk).await {
                    Ok(()) => {
                        trace!(chunk = index + 1, total = chunks.len(), path = %path.addr, "chunk sent");
                        break;
                    }
                    Err(e) => {
                        warn!(path = %path.addr, error = %e, "send failed, marking path inactive");
                        path.mark_inactive();
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop probing and close every path.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let probes: Vec<_> = self
            .probes
            .lock()
            .expect("probe list poisoned")
            .drain(..)
            .collect();
        for probe in probes {
            let _ = probe.await;
        }
        let paths = self.paths.write().expect("path list poisoned");
        for path in paths.iter() {
            path.conn.close(0, b"session closed");
        }
    }

    fn select_path(&self) -> Option<Arc<Path>> {
        let paths = self.paths.read().expect("path list poisoned");
        if paths.is_empty() {
            return None;
        }
        let strategy = *self.strategy.lock().expect("strategy poisoned");
        match strategy {
            PathStrategy::RoundRobin => self.select_round_robin(&paths),
            PathStrategy::MinRtt => paths
                .iter()
                .filter(|p| p.is_active())
                .min_by_key(|p| p.rtt())
                .cloned(),
            PathStrategy::Weighted => self.select_weighted(&paths),
        }
    }

    fn select_round_robin(&self, paths: &[Arc<Path>]) -> Option<Arc<Path>> {
        let mut cursor = self.cursor.lock().expect("cursor poisoned");
        for offset in 0..paths.len() {
            let index = (*cursor + offset) % paths.len();
            if paths[index].is_active() {
                *cursor = (index + 1) % paths.len();
                return Some(paths[index].clone());
            }
        }
        None
    }

    fn select_weighted(&self, paths: &[Arc<Path>]) -> Option<Arc<Path>> {
        let total: u64 = paths
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.bandwidth())
            .sum();
        if total == 0 {
            return self.select_round_robin(paths);
        }
        let target = rand::thread_rng().gen_range(0..total);
        let mut cumulative = 0u64;
        for path in paths.iter().filter(|p| p.is_active()) {
            cumulative += path.bandwidth();
            if cumulative > target {
                return Some(path.clone());
            }
        }
        None
    }
}

async fn send_chunk(path: &Path, chunk: &[u8]) -> Result<()> {
    let mut stream = path.conn.open_stream().await?;
    stream.write_all(chunk).await?;
    stream.shutdown().await?;
    Ok(())
}

// Refresh one path's metrics until shutdown or connection loss. Transports
// without counters keep the placeholder metrics rather than overwriting
// manual or historical values with stub constants.
async fn probe_path(path: Arc<Path>, mut shutdown: watch::Receiver<bool>) {
    let sampler = ConnectionSampler::new(path.conn.clone());
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => break,
            _ = ticker.tick() => {
                if path.conn.is_closed() {
                    path.mark_inactive();
                    break;
                }
                if path.conn.stats().is_some() {
                    let sample = sampler.sample();
                    path.set_metrics(sample.rtt, sample.loss, sample.bandwidth);
                }
                trace!(
                    path = %path.addr,
                    rtt_ms = path.rtt().as_millis() as u64,
                    loss = path.loss(),
                    bandwidth = path.bandwidth(),
                    "path probe"
                );
            }
        }
    }
}
