use super::engine::SyncEngine;
use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Runs fleet passes back to back with `interval` between them.
///
/// The next pass is only scheduled once the previous one has returned, so passes
/// never overlap. Metrics are logged and reset once per `metrics_window`.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    metrics_window: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let settings = engine.settings();
        let interval = settings.interval();
        let metrics_window = Duration::from_secs(settings.metrics_reset_seconds);
        Self { engine, interval, metrics_window }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Loop until `shutdown` flips to `true`. A pass in flight is cancelled by the
    /// caller through [`SyncEngine::cancel`] and allowed to wind down.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut window_started = Instant::now();
        let mut passes = 0;
        loop {
            self.engine.run_pass().await;
            passes += 1;

            if window_started.elapsed() >= self.metrics_window {
                let snapshot = self.engine.metrics().snapshot_and_reset();
                info!(
                    "Sync metrics: {} fetches, {} source errors ({} timeouts, {} rate limited), {} not found, {} passes ({} incomplete)",
                    snapshot.authoritative_fetches,
                    snapshot.source_errors,
                    snapshot.timeouts,
                    snapshot.rate_limited,
                    snapshot.not_found,
                    snapshot.passes,
                    snapshot.incomplete_passes
                );
                window_started = Instant::now();
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped after {} passes", passes);
        passes
    }
}
