use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

#[derive(Debug)]
struct InnerMetrics {
    started: Instant,
    rows: AtomicU64,
    data_bytes: AtomicU64,
    file_bytes: AtomicU64,
    tasks_done: AtomicU64,
    tasks_failed: AtomicU64,
    retry_count: AtomicU64,
    warnings: AtomicU64,
}

/// Shared counters for one dump or load run.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rows: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub retry_count: u64,
    pub warnings: u64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn rows_per_sec(&self) -> f64 {
        per_second(self.rows, self.elapsed)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        per_second(self.data_bytes, self.elapsed)
    }

    /// Estimated time left to reach `total_bytes` at the current rate.
    pub fn eta(&self, total_bytes: u64) -> Option<Duration> {
        let rate = self.bytes_per_sec();
        if rate <= 0.0 || total_bytes <= self.data_bytes {
            return None;
        }
        Some(Duration::from_secs_f64(
            (total_bytes - self.data_bytes) as f64 / rate,
        ))
    }
}

fn per_second(value: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 { 0.0 } else { value as f64 / secs }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Arc::new(InnerMetrics {
                started: Instant::now(),
                rows: AtomicU64::new(0),
                data_bytes: AtomicU64::new(0),
                file_bytes: AtomicU64::new(0),
                tasks_done: AtomicU64::new(0),
                tasks_failed: AtomicU64::new(0),
                retry_count: AtomicU64::new(0),
                warnings: AtomicU64::new(0),
            }),
        }
    }

    pub fn increment_rows(&self, count: u64) {
        self.inner.rows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_bytes(&self, data_bytes: u64, file_bytes: u64) {
        self.inner
            .data_bytes
            .fetch_add(data_bytes, Ordering::Relaxed);
        self.inner
            .file_bytes
            .fetch_add(file_bytes, Ordering::Relaxed);
    }

    pub fn increment_done(&self) {
        self.inner.tasks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failures(&self) {
        self.inner.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retries(&self, count: u64) {
        self.inner.retry_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_warnings(&self) {
        self.inner.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows: self.inner.rows.load(Ordering::Relaxed),
            data_bytes: self.inner.data_bytes.load(Ordering::Relaxed),
            file_bytes: self.inner.file_bytes.load(Ordering::Relaxed),
            tasks_done: self.inner.tasks_done.load(Ordering::Relaxed),
            tasks_failed: self.inner.tasks_failed.load(Ordering::Relaxed),
            retry_count: self.inner.retry_count.load(Ordering::Relaxed),
            warnings: self.inner.warnings.load(Ordering::Relaxed),
            elapsed: self.inner.started.elapsed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.increment_rows(10);
        clone.increment_bytes(100, 40);
        metrics.increment_done();
        let snap = metrics.snapshot();
        assert_eq!((snap.rows, snap.data_bytes, snap.file_bytes), (10, 100, 40));
        assert_eq!(snap.tasks_done, 1);
    }

    #[test]
    fn eta_from_rate() {
        let snap = MetricsSnapshot {
            data_bytes: 100,
            elapsed: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(snap.eta(300), Some(Duration::from_secs(20)));
        assert_eq!(snap.eta(50), None);
    }
}
