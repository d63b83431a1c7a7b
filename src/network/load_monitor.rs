// src/network/load_monitor.rs
// Event-loop lag sampling. A ticker scheduled every `interval` records how
// late it actually woke up; sustained lateness means the runtime is saturated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Default)]
pub struct LoadMonitor {
    lag_millis: Arc<AtomicU64>,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent lag sample
    pub fn lag(&self) -> Duration {
        Duration::from_millis(self.lag_millis.load(Ordering::Relaxed))
    }

    pub fn is_overloaded(&self, max_lag: Duration) -> bool {
        self.lag() > max_lag
    }

    /// Override the current sample (tests, external probes)
    pub fn record(&self, lag: Duration) {
        self.lag_millis
            .store(lag.as_millis().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// Spawn the sampling task; it stops when `shutdown` fires.
    pub fn spawn(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    scheduled = ticker.tick() => {
                        let lag = tokio::time::Instant::now().saturating_duration_since(scheduled);
                        monitor.record(lag);
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("load monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
