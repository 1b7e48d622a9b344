// Run Analytics
// Concurrency gauge and per-run counters; observability only

use crate::orchestrator::models::{UnitResult, UnitStatus};

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracks units in flight and the highest value seen
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one unit in flight until the guard is dropped
    pub fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            gauge: Arc::clone(self),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    gauge: Arc<ConcurrencyGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters for one scenario execution run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunAnalytics {
    pub total_units: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stopped: usize,
    pub average_duration: Duration,
    pub cumulative_duration: Duration,
    pub peak_concurrency: usize,
}

impl RunAnalytics {
    /// Fold settled unit results. Durations only count units that actually ran.
    pub fn from_results(results: &[UnitResult], peak_concurrency: usize) -> Self {
        let mut analytics = RunAnalytics {
            total_units: results.len(),
            peak_concurrency,
            ..Default::default()
        };
        let mut ran = 0u32;

        for result in results {
            match result.status {
                UnitStatus::Completed => analytics.successful += 1,
                UnitStatus::Failed => analytics.failed += 1,
                UnitStatus::Skipped => analytics.skipped += 1,
                UnitStatus::Stopped => analytics.stopped += 1,
            }
            if result.status != UnitStatus::Skipped {
                ran += 1;
                analytics.cumulative_duration += result.duration;
            }
        }

        if ran > 0 {
            analytics.average_duration = analytics.cumulative_duration / ran;
        }
        analytics
    }
}
