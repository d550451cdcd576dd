//! Lock-free counters for the sync layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Hub-wide metrics using relaxed atomics
pub struct SyncMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_malformed: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    rehomes: AtomicU64,
    callback_panics: AtomicU64,
    refresh_ok: AtomicU64,
    refresh_failed: AtomicU64,
    refresh_sum_us: AtomicU64,
    refresh_max_us: AtomicU64,
    start_time: Instant,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            rehomes: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
            refresh_ok: AtomicU64::new(0),
            refresh_failed: AtomicU64::new(0),
            refresh_sum_us: AtomicU64::new(0),
            refresh_max_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gap(&self) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rehome(&self) {
        self.rehomes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the completion of a leaderboard refresh
    pub fn record_refresh(&self, latency_us: u64, success: bool) {
        if success {
            self.refresh_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refresh_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.refresh_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let mut current = self.refresh_max_us.load(Ordering::Relaxed);
        while latency_us > current {
            match self.refresh_max_us.compare_exchange_weak(
                current,
                latency_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let refresh_ok = self.refresh_ok.load(Ordering::Relaxed);
        let refresh_failed = self.refresh_failed.load(Ordering::Relaxed);
        let refreshes = refresh_ok + refresh_failed;

        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            rehomes: self.rehomes.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            refresh_ok,
            refresh_failed,
            avg_refresh_us: if refreshes > 0 {
                self.refresh_sum_us.load(Ordering::Relaxed) / refreshes
            } else {
                0
            },
            max_refresh_us: self.refresh_max_us.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of sync metrics at a point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped_malformed: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub rehomes: u64,
    pub callback_panics: u64,
    pub refresh_ok: u64,
    pub refresh_failed: u64,
    pub avg_refresh_us: u64,
    pub max_refresh_us: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Format as human-readable string
    pub fn to_string_pretty(&self) -> String {
        format!(
            "Published: {} | Delivered: {}\n\
             Dropped malformed: {} | Duplicates: {} | Gaps: {}\n\
             Re-homes: {} | Callback panics: {}\n\
             Refresh ok/failed: {}/{} ({} avg, {} max μs)\n\
             Uptime: {}s",
            self.published,
            self.delivered,
            self.dropped_malformed,
            self.duplicates,
            self.gaps,
            self.rehomes,
            self.callback_panics,
            self.refresh_ok,
            self.refresh_failed,
            self.avg_refresh_us,
            self.max_refresh_us,
            self.uptime_seconds,
        )
    }
}

/// Times a leaderboard refresh and records it on drop
pub struct RefreshTimer<'a> {
    metrics: &'a SyncMetrics,
    start: Instant,
    success: bool,
}

impl<'a> RefreshTimer<'a> {
    pub fn new(metrics: &'a SyncMetrics) -> Self {
        Self {
            metrics,
            start: Instant::now(),
            success: false,
        }
    }

    pub fn mark_success(&mut self) {
        self.success = true;
    }
}

impl<'a> Drop for RefreshTimer<'a> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_micros() as u64;
        self.metrics.record_refresh(elapsed, self.success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_timer_records_outcome() {
        let metrics = SyncMetrics::new();
        {
            let mut timer = RefreshTimer::new(&metrics);
            timer.mark_success();
        }
        {
            let _failed = RefreshTimer::new(&metrics);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.refresh_ok, 1);
        assert_eq!(snap.refresh_failed, 1);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = SyncMetrics::default();
        metrics.record_published();
        metrics.record_delivered();
        metrics.record_delivered();
        metrics.record_gap();
        let snap = metrics.snapshot();
        assert_eq!((snap.published, snap.delivered, snap.gaps), (1, 2, 1));
        assert!(snap.to_string_pretty().contains("Gaps: 1"));
    }
}
