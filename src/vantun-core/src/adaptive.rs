//! Telemetry-driven FEC parity adjustment.
//!
//! Four multiplicative factors scale the parity shard count: packet loss,
//! RTT (retransmissions get more expensive), available bandwidth (headroom
//! for redundancy), and delivery efficiency. The data shard count k is fixed
//! for the lifetime; m moves by at most 2 per adjustment and stays inside
//! its configured bounds. The codec is rebuilt only when m changes, and only
//! the rate controller task writes it.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::fec::Fec;
use crate::telemetry::TelemetryData;

struct State {
    m: usize,
    codec: Arc<Fec>,
}

/// FEC codec whose parity count follows link telemetry.
pub struct AdaptiveFec {
    k: usize,
    min_parity: usize,
    max_parity: usize,
    state: RwLock<State>,
}

impl AdaptiveFec {
    /// Create with `k` data shards, initial parity `m`, and parity bounds.
    pub fn new(k: usize, m: usize, min_parity: usize, max_parity: usize) -> Result<Self> {
        if min_parity == 0 || min_parity > max_parity {
            return Err(Error::ConfigInvalid(format!(
                "parity bounds out of order: [{min_parity}, {max_parity}]"
            )));
        }
        if m < min_parity || m > max_parity {
            return Err(Error::ConfigInvalid(format!(
                "initial parity {m} outside [{min_parity}, {max_parity}]"
            )));
        }
        Ok(Self {
            k,
            min_parity,
            max_parity,
            state: RwLock::new(State {
                m,
                codec: Arc::new(Fec::new(k, m)?),
            }),
        })
    }

    /// Number of data shards.
    pub fn data_shards(&self) -> usize {
        self.k
    }

    /// Current number of parity shards.
    pub fn parity_shards(&self) -> usize {
        self.state.read().expect("adaptive fec poisoned").m
    }

    /// Current total shard count (k + m).
    pub fn total_shards(&self) -> usize {
        self.k + self.parity_shards()
    }

    /// Snapshot of the current codec.
    pub fn codec(&self) -> Arc<Fec> {
        self.state
            .read()
            .expect("adaptive fec poisoned")
            .codec
            .clone()
    }

    /// Encode with the current codec.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.codec().encode(data)
    }

    /// Decode with the current codec.
    pub fn decode(&self, shards: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>> {
        self.codec().decode(shards)
    }

    /// Recompute the parity count from a telemetry sample.
    ///
    /// A codec rebuild failure leaves the previous state untouched.
    pub fn adjust(&self, sample: &TelemetryData) -> Result<()> {
        let loss = loss_factor(sample.loss);
        let rtt = rtt_factor(sample.rtt);
        let bandwidth = bandwidth_factor(sample.bandwidth);
        let efficiency = efficiency_factor(sample.delivery_rate, sample.bandwidth);
        let combined = loss * rtt * bandwidth * efficiency;

        let current = self.parity_shards();
        let candidate = (current as f64 * combined).round() as i64;
        let clamped = candidate.clamp(self.min_parity as i64, self.max_parity as i64) as usize;
        // At most ±2 shards per adjustment to avoid thrash.
        let new_m = clamped.clamp(current.saturating_sub(2), current + 2);

        if new_m == current {
            return Ok(());
        }

        let codec = Arc::new(Fec::new(self.k, new_m)?);
        let mut state = self.state.write().expect("adaptive fec poisoned");
        debug!(
            from = current,
            to = new_m,
            loss_factor = loss,
            rtt_factor = rtt,
            bandwidth_factor = bandwidth,
            efficiency_factor = efficiency,
            "adjusting fec parity"
        );
        state.m = new_m;
        state.codec = codec;
        Ok(())
    }
}

// Piecewise-linear mapping from loss rate to a parity multiplier. Very low
// loss sheds redundancy, anything above 1% grows it, steeply past 10%.
fn loss_factor(loss: f64) -> f64 {
    if loss <= 0.0 {
        1.0
    } else if loss < 0.01 {
        0.65 + 0.35 * loss / 0.01
    } else if loss <= 0.02 {
        1.0 + (loss - 0.01) * 5.0
    } else if loss <= 0.05 {
        1.05 + (loss - 0.02) * 5.0
    } else if loss <= 0.10 {
        1.15 + (loss - 0.05) * 3.0
    } else {
        1.3 + (loss - 0.10) * 3.0
    }
}

fn rtt_factor(rtt: Duration) -> f64 {
    let rtt_ms = rtt.as_secs_f64() * 1000.0;
    if rtt_ms <= 10.0 {
        1.0
    } else {
        1.0 + (rtt_ms - 10.0) / 300.0
    }
}

fn bandwidth_factor(bandwidth: u64) -> f64 {
    let mbps = bandwidth as f64 / (1024.0 * 1024.0);
    if mbps <= 0.0 {
        return 1.05;
    }
    (1.05 - 0.075 * (mbps / 100.0)).max(0.95)
}

fn efficiency_factor(delivery_rate: u64, bandwidth: u64) -> f64 {
    if bandwidth == 0 {
        return 1.0;
    }
    let efficiency = delivery_rate as f64 / bandwidth as f64;
    if efficiency >= 1.0 {
        1.0
    } else {
        2.0 - efficiency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryData;
    use std::time::SystemTime;

    fn sample(loss: f64, rtt_ms: u64, bandwidth: u64, delivery_rate: u64) -> TelemetryData {
        TelemetryData {
            rtt: Duration::from_millis(rtt_ms),
            loss,
            bandwidth,
            timestamp: SystemTime::now(),
            cwnd: 10_000,
            bytes_in_flight: 1_000,
            delivery_rate,
        }
    }

    #[test]
    fn high_loss_grows_parity() {
        let fec = AdaptiveFec::new(10, 3, 1, 10).unwrap();
        fec.adjust(&sample(0.15, 50, 1_000_000, 1_000_000)).unwrap();
        assert!(fec.parity_shards() > 3);
        // 1.45 * 1.133 * 1.049 * 1.0 over m=3 lands on 5, within the ±2 step.
        assert_eq!(fec.parity_shards(), 5);
    }

    #[test]
    fn parity_saturates_at_upper_bound() {
        let fec = AdaptiveFec::new(10, 3, 1, 10).unwrap();
        let s = sample(0.15, 50, 1_000_000, 1_000_000);
        let mut previous = fec.parity_shards();
        for _ in 0..10 {
            fec.adjust(&s).unwrap();
            let m = fec.parity_shards();
            assert!(m.abs_diff(previous) <= 2);
            assert!((1..=10).contains(&m));
            previous = m;
        }
        assert_eq!(fec.parity_shards(), 10);
    }

    #[test]
    fn clean_link_sheds_parity() {
        let fec = AdaptiveFec::new(10, 6, 1, 10).unwrap();
        fec.adjust(&sample(0.001, 5, 100 * 1024 * 1024, 100 * 1024 * 1024))
            .unwrap();
        assert!(fec.parity_shards() < 6);
        assert!(fec.parity_shards() >= 4, "single step drops at most 2");
    }

    #[test]
    fn never_leaves_bounds() {
        let fec = AdaptiveFec::new(10, 2, 2, 6).unwrap();
        let clean = sample(0.0, 1, 100 * 1024 * 1024, 100 * 1024 * 1024);
        for _ in 0..5 {
            fec.adjust(&clean).unwrap();
            assert!(fec.parity_shards() >= 2);
        }
        let lossy = sample(0.3, 400, 10_000, 1_000);
        for _ in 0..5 {
            fec.adjust(&lossy).unwrap();
            assert!(fec.parity_shards() <= 6);
        }
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(AdaptiveFec::new(10, 3, 5, 4).is_err());
        assert!(AdaptiveFec::new(10, 12, 1, 10).is_err());
        assert!(AdaptiveFec::new(10, 3, 0, 10).is_err());
    }

    #[test]
    fn codec_follows_adjustment() {
        let fec = AdaptiveFec::new(10, 3, 1, 10).unwrap();
        fec.adjust(&sample(0.15, 50, 1_000_000, 1_000_000)).unwrap();
        let codec = fec.codec();
        assert_eq!(codec.parity_shards(), fec.parity_shards());
        let payload = b"parity follows the controller";
        let shards = fec.encode(payload).unwrap();
        assert_eq!(shards.len(), fec.total_shards());

        let slots = shards.into_iter().map(Some).collect();
        let decoded = fec.decode(slots).unwrap();
        assert_eq!(&decoded[..payload.len()], payload);
    }
}
