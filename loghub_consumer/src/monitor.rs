//! Per-shard runtime statistics.
//!
//! Workers record into the current accumulator with plain atomic increments. A single
//! reporter per shard periodically swaps in a fresh accumulator and logs the old one.

use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::{client, model::PullMeta, model::ShardId};

/// An `f64` that supports lock-free accumulation.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn add(&self, v: f64) {
        // the closure always returns Some, so this cannot fail
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + v).to_bits())
            });
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Count, sum and sum of squares of a stream of samples.
#[derive(Debug, Default)]
pub struct TimeHistogram {
    count: AtomicU64,
    sum: AtomicF64,
    sum_of_squares: AtomicF64,
}

impl TimeHistogram {
    pub fn add_sample(&self, v: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(v);
        self.sum_of_squares.add(v * v);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(),
            sum_of_squares: self.sum_of_squares.load(),
        }
    }
}

/// Frozen values of a [`TimeHistogram`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub sum_of_squares: f64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Sample standard deviation, `0` with fewer than two samples.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = (n * self.sum_of_squares - self.sum * self.sum) / (n * (n - 1.0));
        // rounding can push a zero variance slightly negative
        variance.max(0.0).sqrt()
    }
}

impl Display for HistogramSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{avg: {:.1}us, stdDev: {:.1}us, count: {}}}",
            self.mean(),
            self.std_dev(),
            self.count
        )
    }
}

#[derive(Debug, Default)]
struct MonitorMetrics {
    fetch_failures: AtomicU64,
    raw_bytes_fetched: AtomicU64,
    fetch_latency: TimeHistogram,

    process_failures: AtomicU64,
    process_latency: TimeHistogram,
}

impl MonitorMetrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            raw_bytes_fetched: self.raw_bytes_fetched.load(Ordering::Relaxed),
            fetch_latency: self.fetch_latency.snapshot(),
            process_failures: self.process_failures.load(Ordering::Relaxed),
            process_latency: self.process_latency.snapshot(),
        }
    }
}

/// Statistics of one report period. Latencies are in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub fetch_failures: u64,
    pub raw_bytes_fetched: u64,
    pub fetch_latency: HistogramSnapshot,
    pub process_failures: u64,
    pub process_latency: HistogramSnapshot,
}

/// Statistics of a single shard.
#[derive(Debug)]
pub struct ShardMonitor {
    shard: ShardId,
    report_interval: Duration,
    last_report: Mutex<Instant>,
    metrics: ArcSwap<MonitorMetrics>,
}

impl ShardMonitor {
    pub fn new(shard: ShardId, report_interval: Duration) -> Self {
        Self {
            shard,
            report_interval,
            last_report: Mutex::new(Instant::now()),
            metrics: ArcSwap::new(Arc::new(MonitorMetrics::default())),
        }
    }

    /// Record the outcome of a pull that started at `started`.
    pub fn record_fetch(&self, outcome: Result<&PullMeta, &client::Error>, started: Instant) {
        let metrics = self.metrics.load();
        match outcome {
            Ok(meta) => {
                metrics
                    .raw_bytes_fetched
                    .fetch_add(meta.raw_size as u64, Ordering::Relaxed);
            }
            Err(_) => {
                metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics
            .fetch_latency
            .add_sample(started.elapsed().as_micros() as f64);
    }

    /// Record one processor invocation that started at `started`.
    pub fn record_process(&self, failed: bool, started: Instant) {
        let metrics = self.metrics.load();
        if failed {
            metrics.process_failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics
            .process_latency
            .add_sample(started.elapsed().as_micros() as f64);
    }

    /// Whether the report interval elapsed since the last report.
    pub fn should_report(&self) -> bool {
        self.last_report.lock().elapsed() >= self.report_interval
    }

    /// Swap in an empty accumulator and return the statistics gathered so far.
    ///
    /// Only one reporter may call this for a given shard. Concurrent recorders are fine,
    /// concurrent reporters could read a half-reset period.
    pub fn report_and_reset(&self) -> MetricsSnapshot {
        *self.last_report.lock() = Instant::now();
        let previous = self.metrics.swap(Arc::new(MonitorMetrics::default()));
        previous.snapshot()
    }

    /// Drain the statistics into the log.
    pub fn report(&self) -> MetricsSnapshot {
        let snapshot = self.report_and_reset();
        info!(
            shard_id=%self.shard,
            fetch_failed=snapshot.fetch_failures,
            raw_bytes=snapshot.raw_bytes_fetched,
            process_failed=snapshot.process_failures,
            fetch=%snapshot.fetch_latency,
            process=%snapshot.process_latency,
            "report status"
        );
        snapshot
    }
}
