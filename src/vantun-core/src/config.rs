//! JSON configuration with hot reload.
//!
//! The config file is re-read on a fixed cadence and diffed field by field.
//! Only the log level is applied to a running process (through the callback
//! given to [`ConfigManager::start`]); every other change takes effect for
//! new sessions only, which is logged when it happens.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// How often the config file is polled for changes.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Top-level VANTUN configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run as server
    pub server: bool,
    /// Address to listen on (server) or connect to (client)
    pub address: String,
    /// Log level: debug, info, warn, error
    pub log_level: String,
    /// Spread traffic across multiple paths
    pub multipath: bool,
    /// Disguise streams as HTTP/3 frames
    pub obfs: bool,
    /// FEC data shard count
    pub fec_data: usize,
    /// FEC parity shard count
    pub fec_parity: usize,
    /// Initial token bucket rate, bytes per second
    pub token_bucket_rate: f64,
    /// Token bucket capacity, bytes
    pub token_bucket_capacity: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: false,
            address: "localhost:4242".into(),
            log_level: "info".into(),
            multipath: false,
            obfs: false,
            fec_data: 10,
            fec_parity: 3,
            token_bucket_rate: 1_000_000.0,
            token_bucket_capacity: 5_000_000.0,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| Error::ConfigInvalid(format!("parsing {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::ConfigInvalid("address must not be empty".into()));
        }
        if self.fec_data == 0 || self.fec_parity == 0 {
            return Err(Error::ConfigInvalid(format!(
                "fec shard counts must be positive, got {}/{}",
                self.fec_data, self.fec_parity
            )));
        }
        if self.token_bucket_rate <= 0.0 || self.token_bucket_capacity <= 0.0 {
            return Err(Error::ConfigInvalid(
                "token bucket rate and capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Watches a config file and applies live-reloadable fields.
pub struct ConfigManager {
    path: PathBuf,
    current: Arc<RwLock<Config>>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigManager {
    /// Load the file and build a manager around it.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_interval(path, RELOAD_INTERVAL)
    }

    /// Manager with a custom poll interval.
    pub fn with_interval(path: impl Into<PathBuf>, interval: Duration) -> Result<Self> {
        let path = path.into();
        let config = Config::load(&path)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            path,
            current: Arc::new(RwLock::new(config)),
            interval,
            shutdown,
            handle: Mutex::new(None),
        })
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Config {
        self.current.read().expect("config poisoned").clone()
    }

    /// Start the reload watcher.
    ///
    /// `on_log_level` runs whenever the file's log level changes; it is the
    /// only field applied live.
    pub fn start<F>(&self, on_log_level: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut handle = self.handle.lock().expect("watcher handle poisoned");
        if handle.is_some() {
            return;
        }

        let path = self.path.clone();
        let current = self.current.clone();
        let interval = self.interval;
        let mut shutdown = self.shutdown.subscribe();

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => break,
                    _ = ticker.tick() => {
                        let new = match Config::load(&path) {
                            Ok(config) => config,
                            Err(e) => {
                                warn!(error = %e, "failed to reload config, keeping current");
                                continue;
                            }
                        };
                        let old = current.read().expect("config poisoned").clone();
                        if new == old {
                            continue;
                        }

                        info!("configuration changed, reloading");
                        if new.log_level != old.log_level {
                            on_log_level(&new.log_level);
                        }
                        if non_live_fields_changed(&old, &new) {
                            info!("non-logging changes take effect for new sessions only");
                        }
                        *current.write().expect("config poisoned") = new;
                    }
                }
            }
        }));
    }

    /// Stop the watcher and join it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("watcher handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn non_live_fields_changed(old: &Config, new: &Config) -> bool {
    let mut old_rest = old.clone();
    let mut new_rest = new.clone();
    old_rest.log_level = String::new();
    new_rest.log_level = String::new();
    old_rest != new_rest
}
