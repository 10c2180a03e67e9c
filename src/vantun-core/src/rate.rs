//! Rate controller: the telemetry→control feedback loop.
//!
//! One task ticks once per interval. Each tick samples telemetry, reports it
//! to the peer when a reporter is attached (best-effort), nudges the token
//! bucket rate from the observed loss, and lets the adaptive FEC adjust its
//! parity. Ticks are serialized; a slow tick delays the next rather than
//! queueing behind it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adaptive::AdaptiveFec;
use crate::bucket::TokenBucket;
use crate::telemetry::{StubSampler, TelemetryReporter, TelemetrySampler};
use crate::transport::TunnelStream;

/// Ceiling on the token bucket rate (10 MB/s).
pub const MAX_RATE: f64 = 10_000_000.0;

/// Default tick interval.
pub const CONTROL_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the token bucket and adaptive FEC from telemetry.
pub struct RateController {
    bucket: Arc<TokenBucket>,
    adaptive: Option<Arc<AdaptiveFec>>,
    sampler: Arc<Mutex<Arc<dyn TelemetrySampler>>>,
    reporter: Arc<tokio::sync::Mutex<Option<TelemetryReporter>>>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RateController {
    /// Create a controller over `bucket`, optionally adjusting `adaptive`.
    ///
    /// Starts with the stub sampler; attach a connection-backed sampler once
    /// a connection exists.
    pub fn new(bucket: Arc<TokenBucket>, adaptive: Option<Arc<AdaptiveFec>>) -> Self {
        Self::with_interval(bucket, adaptive, CONTROL_INTERVAL)
    }

    /// Create with a custom tick interval.
    pub fn with_interval(
        bucket: Arc<TokenBucket>,
        adaptive: Option<Arc<AdaptiveFec>>,
        interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bucket,
            adaptive,
            sampler: Arc::new(Mutex::new(Arc::new(StubSampler))),
            reporter: Arc::new(tokio::sync::Mutex::new(None)),
            interval,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// The controlled bucket.
    pub fn bucket(&self) -> Arc<TokenBucket> {
        self.bucket.clone()
    }

    /// Replace the telemetry source. Takes effect on the next tick.
    pub fn attach_sampler(&self, sampler: Arc<dyn TelemetrySampler>) {
        *self.sampler.lock().expect("sampler slot poisoned") = sampler;
    }

    /// Attach a telemetry stream for best-effort peer reporting.
    pub async fn set_telemetry_stream(&self, stream: Box<dyn TunnelStream>) {
        *self.reporter.lock().await = Some(TelemetryReporter::new(stream));
    }

    /// Spawn the control loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("controller handle poisoned");
        if handle.is_some() {
            return;
        }

        let bucket = self.bucket.clone();
        let adaptive = self.adaptive.clone();
        let sampler = self.sampler.clone();
        let reporter = self.reporter.clone();
        let interval = self.interval;
        let mut shutdown = self.shutdown.subscribe();

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => continue,
                    _ = ticker.tick() => {
                        let current = sampler.lock().expect("sampler slot poisoned").clone();
                        let data = current.sample();

                        if let Some(rep) = reporter.lock().await.as_mut() {
                            if let Err(e) = rep.report(&data).await {
                                warn!(error = %e, "telemetry report failed");
                            }
                        }

                        if data.loss > 0.05 {
                            let new_rate = bucket.rate() * 0.9;
                            bucket.set_rate(new_rate);
                            debug!(rate = new_rate, loss = data.loss, "reducing send rate");
                        } else if data.loss < 0.01 {
                            let new_rate = (bucket.rate() * 1.1).min(MAX_RATE);
                            bucket.set_rate(new_rate);
                            debug!(rate = new_rate, loss = data.loss, "raising send rate");
                        }

                        if let Some(fec) = &adaptive {
                            if let Err(e) = fec.adjust(&data) {
                                warn!(error = %e, "fec adjustment failed, keeping previous codec");
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Signal shutdown and join the worker. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .handle
            .lock()
            .expect("controller handle poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryData;
    use std::time::SystemTime;

    struct FixedSampler {
        loss: f64,
    }

    impl TelemetrySampler for FixedSampler {
        fn sample(&self) -> TelemetryData {
            TelemetryData {
                rtt: Duration::from_millis(50),
                loss: self.loss,
                bandwidth: 1_000_000,
                timestamp: SystemTime::now(),
                cwnd: 10_000,
                bytes_in_flight: 1_000,
                delivery_rate: 1_000_000,
            }
        }
    }

    #[tokio::test]
    async fn high_loss_reduces_rate() {
        let bucket = Arc::new(TokenBucket::new(1_000_000.0, 5_000_000.0));
        let controller =
            RateController::with_interval(bucket.clone(), None, Duration::from_millis(20));
        controller.attach_sampler(Arc::new(FixedSampler { loss: 0.10 }));
        controller.start();

        tokio::time::sleep(Duration::from_millis(120)).await;
        controller.stop().await;

        assert!(bucket.rate() < 1_000_000.0);
    }

    #[tokio::test]
    async fn low_loss_raises_rate_to_ceiling() {
        let bucket = Arc::new(TokenBucket::new(9_500_000.0, 5_000_000.0));
        let controller =
            RateController::with_interval(bucket.clone(), None, Duration::from_millis(10));
        controller.attach_sampler(Arc::new(FixedSampler { loss: 0.0 }));
        controller.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.stop().await;

        let rate = bucket.rate();
        assert!(rate > 9_500_000.0);
        assert!(rate <= MAX_RATE);
    }

    #[tokio::test]
    async fn moderate_loss_leaves_rate_alone() {
        let bucket = Arc::new(TokenBucket::new(2_000_000.0, 5_000_000.0));
        let controller =
            RateController::with_interval(bucket.clone(), None, Duration::from_millis(20));
        controller.attach_sampler(Arc::new(FixedSampler { loss: 0.03 }));
        controller.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop().await;

        assert!((bucket.rate() - 2_000_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn controller_adjusts_fec() {
        let bucket = Arc::new(TokenBucket::new(1_000_000.0, 5_000_000.0));
        let adaptive = Arc::new(AdaptiveFec::new(10, 3, 1, 10).unwrap());
        let controller = RateController::with_interval(
            bucket,
            Some(adaptive.clone()),
            Duration::from_millis(20),
        );
        controller.attach_sampler(Arc::new(FixedSampler { loss: 0.15 }));
        controller.start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        controller.stop().await;

        assert!(adaptive.parity_shards() > 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let bucket = Arc::new(TokenBucket::new(1_000_000.0, 5_000_000.0));
        let controller = RateController::with_interval(bucket, None, Duration::from_millis(20));
        controller.start();
        controller.stop().await;
        controller.stop().await;
    }
}
