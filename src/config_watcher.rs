//! Configuration hot reload
//!
//! Polls the config file's modification time. A changed file is re-loaded
//! and validated; invalid files are logged and the old config stays active.
//! Subscribers are only notified when risk limits or capital changed, since
//! everything else needs a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GatekeeperConfig};
use crate::domain::services::gatekeeper::Gatekeeper;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    last_modified: Mutex<SystemTime>,
    current: watch::Sender<Arc<GatekeeperConfig>>,
    stop: watch::Sender<bool>,
}

fn modified(path: &Path) -> Result<SystemTime, std::io::Error> {
    std::fs::metadata(path)?.modified()
}

impl ConfigWatcher {
    /// Fails if the file cannot be stat'ed.
    pub fn new(path: impl Into<PathBuf>, initial: GatekeeperConfig) -> Result<Self, ConfigError> {
        let path = path.into();
        let last_modified = modified(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let (current, _) = watch::channel(Arc::new(initial));
        let (stop, _) = watch::channel(false);

        Ok(Self {
            path,
            interval: DEFAULT_POLL_INTERVAL,
            last_modified: Mutex::new(last_modified),
            current,
            stop,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Most recently applied valid config
    pub fn current(&self) -> Arc<GatekeeperConfig> {
        self.current.borrow().clone()
    }

    /// Receiver that wakes on every applied risk change
    pub fn subscribe(&self) -> watch::Receiver<Arc<GatekeeperConfig>> {
        self.current.subscribe()
    }

    /// Poll once. Returns the new config if one was applied.
    pub fn check_for_changes(&self) -> Option<Arc<GatekeeperConfig>> {
        let modified_at = match modified(&self.path) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(path = %self.path.display(), "config stat error: {}", e);
                return None;
            }
        };

        {
            let mut last = self
                .last_modified
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if modified_at <= *last {
                return None;
            }
            *last = modified_at;
        }

        let new_config = match GatekeeperConfig::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.path.display(), "config reload rejected, keeping old config: {}", e);
                return None;
            }
        };

        let old_config = self.current();
        if !old_config.risk_changed(&new_config) {
            debug!("config file changed but risk settings unchanged, skipping");
            return None;
        }

        log_risk_changes(&old_config, &new_config);
        let new_config = Arc::new(new_config);
        self.current.send_replace(new_config.clone());
        Some(new_config)
    }

    /// Start polling in the background until `stop` is called.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        info!(
            path = %self.path.display(),
            "watching config for changes (poll interval: {:?})",
            self.interval
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.interval);
            ticker.tick().await;
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        watcher.check_for_changes();
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Safe to call more than once.
    pub fn stop(&self) {
        let was_stopped = self.stop.send_replace(true);
        if !was_stopped {
            info!("config watcher stopped");
        }
    }
}

fn log_risk_changes(old: &GatekeeperConfig, new: &GatekeeperConfig) {
    let (o, n) = (&old.risk.limits, &new.risk.limits);
    if old.capital != new.capital {
        info!("capital: {:.2} -> {:.2}", old.capital, new.capital);
    }
    if o.max_risk_per_trade_pct != n.max_risk_per_trade_pct {
        info!(
            "max_risk_per_trade_pct: {:.2} -> {:.2}",
            o.max_risk_per_trade_pct, n.max_risk_per_trade_pct
        );
    }
    if o.max_open_positions != n.max_open_positions {
        info!("max_open_positions: {} -> {}", o.max_open_positions, n.max_open_positions);
    }
    if o.max_daily_loss_pct != n.max_daily_loss_pct {
        info!(
            "max_daily_loss_pct: {:.2} -> {:.2}",
            o.max_daily_loss_pct, n.max_daily_loss_pct
        );
    }
    if o.max_capital_deployment_pct != n.max_capital_deployment_pct {
        info!(
            "max_capital_deployment_pct: {:.2} -> {:.2}",
            o.max_capital_deployment_pct, n.max_capital_deployment_pct
        );
    }
    if o.max_per_sector != n.max_per_sector {
        info!("max_per_sector: {} -> {}", o.max_per_sector, n.max_per_sector);
    }
    if old.risk.circuit_breaker != new.risk.circuit_breaker {
        info!(
            "circuit_breaker: {:?} -> {:?}",
            old.risk.circuit_breaker, new.risk.circuit_breaker
        );
    }
}

/// Push every reloaded config into the gatekeeper until the watcher is dropped.
pub fn apply_to_gatekeeper(
    mut updates: watch::Receiver<Arc<GatekeeperConfig>>,
    gatekeeper: Arc<Gatekeeper>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let config = updates.borrow_and_update().clone();
            gatekeeper
                .apply_config(
                    config.risk.limits.clone(),
                    config.risk.circuit_breaker.clone(),
                    config.capital,
                )
                .await;
        }
    })
}
