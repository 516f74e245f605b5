//! Periodic reaper reclaiming stock from timed-out reservations.

use crate::config::ReservationConfig;
use crate::services::reservations::ReservationService;
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

lazy_static! {
    static ref REAPER_SWEEPS: IntCounter = IntCounter::new(
        "reservation_reaper_sweeps_total",
        "Total number of reaper sweeps executed"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub batch_size: u64,
    pub time_budget: Duration,
}

impl From<&ReservationConfig> for ReaperConfig {
    fn from(cfg: &ReservationConfig) -> Self {
        Self {
            interval: cfg.reap_interval(),
            batch_size: cfg.reap_batch_size,
            time_budget: cfg.reap_time_budget(),
        }
    }
}

/// Background worker driving `ReservationService::reap_expired` on a fixed
/// cadence. Multiple instances are safe: the per-item status CAS means at
/// most one reaper wins each row, the others see a no-op.
pub struct ExpiryReaper {
    service: ReservationService,
    config: ReaperConfig,
    shutdown: watch::Receiver<bool>,
}

impl ExpiryReaper {
    pub fn new(
        service: ReservationService,
        config: ReaperConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(interval = ?self.config.interval, "expiry reaper started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh boot does not
        // race the migrations it may be waiting on.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("expiry reaper stopped");
    }

    /// Drains expired reservations batch by batch until the scan comes back
    /// empty or the sweep's time budget lapses. The stop signal is honored at
    /// batch boundaries; the in-flight item always completes.
    pub async fn sweep(&self) -> u64 {
        REAPER_SWEEPS.inc();
        let started = Instant::now();
        let mut total = 0u64;

        loop {
            let now = Utc::now();
            match self.service.reap_expired(now, self.config.batch_size).await {
                Ok(0) => break,
                Ok(reaped) => {
                    total += reaped;
                }
                Err(e) => {
                    error!(error = %e, "reap batch failed");
                    break;
                }
            }
            if started.elapsed() >= self.config.time_budget {
                warn!(
                    total,
                    budget_ms = self.config.time_budget.as_millis() as u64,
                    "reap sweep hit its time budget; remaining rows wait for the next tick"
                );
                break;
            }
            if *self.shutdown.borrow() {
                break;
            }
        }

        // Same cadence also ages out used idempotency keys.
        if let Err(e) = self.service.purge_idempotency_keys(Utc::now()).await {
            warn!(error = %e, "idempotency purge failed");
        }

        total
    }
}
