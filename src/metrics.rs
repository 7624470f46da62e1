// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    describe_counter, describe_gauge, describe_histogram, gauge, histogram, increment_counter,
};

// NOTE: When observability feature is disabled, provide stub implementations.
// The stubs borrow their values so call sites compile the same in both modes.

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

use crate::error::SourceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "sync_authoritative_fetches_total",
        "Calls made to a chain node or oracle to refresh a cached entity, labeled by entity kind."
    );
    describe_counter!(
        "sync_source_errors_total",
        "Transient collaborator failures (timeouts, rate limits, malformed responses), labeled by kind."
    );
    describe_counter!(
        "sync_not_found_total",
        "Lookups for which the authoritative source had no such entity."
    );
    describe_counter!("sync_passes_total", "Completed synchronization passes.");
    describe_counter!(
        "sync_incomplete_chains_total",
        "Chains that hit the pass deadline before finishing, labeled by chain."
    );
    describe_histogram!("sync_pass_duration_ms", "Wall time of a full fleet pass.");
    describe_histogram!(
        "sync_stage_duration_ms",
        "Wall time of one pipeline stage, labeled by chain and stage."
    );
    describe_gauge!("sync_release_scan_cursor", "Last block scanned for release sales.");
}

/// Install the Prometheus recorder on `addr`.
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

/// Counters for one reporting window, as returned by [`SyncMetrics::snapshot_and_reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub authoritative_fetches: u64,
    pub source_errors: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    pub not_found: u64,
    pub passes: u64,
    pub incomplete_passes: u64,
}

/// Error and call tallies for the sync engine.
///
/// Owned by the engine and reset by the scheduler once per reporting window.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    authoritative_fetches: AtomicU64,
    source_errors: AtomicU64,
    timeouts: AtomicU64,
    rate_limited: AtomicU64,
    not_found: AtomicU64,
    passes: AtomicU64,
    incomplete_passes: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch(&self, kind: &'static str) {
        self.authoritative_fetches.fetch_add(1, Ordering::Relaxed);
        increment_counter!("sync_authoritative_fetches_total", "kind" => kind);
    }

    pub fn record_not_found(&self, kind: &'static str) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
        increment_counter!("sync_not_found_total", "kind" => kind);
    }

    pub fn record_source_error(&self, kind: &'static str, error: &SourceError) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
        match error {
            SourceError::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            SourceError::RateLimited => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        increment_counter!("sync_source_errors_total", "kind" => kind);
    }

    pub fn record_pass(&self, duration: Duration, incomplete_chains: &[String]) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        if !incomplete_chains.is_empty() {
            self.incomplete_passes.fetch_add(1, Ordering::Relaxed);
        }
        for chain in incomplete_chains {
            increment_counter!("sync_incomplete_chains_total", "chain" => chain.clone());
        }
        increment_counter!("sync_passes_total");
        histogram!("sync_pass_duration_ms", duration.as_millis() as f64);
    }

    pub fn record_stage(&self, chain: &str, stage: &'static str, duration: Duration) {
        histogram!(
            "sync_stage_duration_ms",
            duration.as_millis() as f64,
            "chain" => chain.to_string(),
            "stage" => stage
        );
    }

    pub fn record_scan_cursor(&self, chain: &str, block: u64) {
        gauge!("sync_release_scan_cursor", block as f64, "chain" => chain.to_string());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            authoritative_fetches: self.authoritative_fetches.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            incomplete_passes: self.incomplete_passes.load(Ordering::Relaxed),
        }
    }

    /// Return the current window's counters and start a new window at zero.
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            authoritative_fetches: self.authoritative_fetches.swap(0, Ordering::Relaxed),
            source_errors: self.source_errors.swap(0, Ordering::Relaxed),
            timeouts: self.timeouts.swap(0, Ordering::Relaxed),
            rate_limited: self.rate_limited.swap(0, Ordering::Relaxed),
            not_found: self.not_found.swap(0, Ordering::Relaxed),
            passes: self.passes.swap(0, Ordering::Relaxed),
            incomplete_passes: self.incomplete_passes.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = SyncMetrics::new();
        metrics.record_fetch("listing");
        metrics.record_fetch("offer");
        metrics.record_source_error("listing", &SourceError::Timeout);
        metrics.record_source_error("price", &SourceError::RateLimited);
        metrics.record_source_error("nft", &SourceError::Transport("reset".into()));
        metrics.record_pass(Duration::from_millis(10), &["polygon".to_string()]);

        let snap = metrics.snapshot_and_reset();
        assert_eq!(snap.authoritative_fetches, 2);
        assert_eq!(snap.source_errors, 3);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.passes, 1);
        assert_eq!(snap.incomplete_passes, 1);

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
