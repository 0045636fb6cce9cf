//! Transfer metrics
//!
//! Lock-free counters, gauges and histograms rendered in the Prometheus text
//! format. Each [`Client`](crate::Client) owns one [`TransferMetrics`].

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Upper bounds, in seconds, of the part latency buckets
const PART_LATENCY_BOUNDS: [f64; 12] = [
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Monotonic total
pub struct Counter {
    name: &'static str,
    help: &'static str,
    total: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            total: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Level that moves both ways
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    level: AtomicI64,
}

impl Gauge {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            level: AtomicI64::new(0),
        }
    }

    pub fn inc(&self) {
        self.level.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.level.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.level.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Latency distribution in seconds
///
/// Bucket counts are cumulative. The sum is kept in whole microseconds.
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: Vec<f64>,
    hits: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    observations: AtomicU64,
}

impl Histogram {
    /// Buckets from 10ms to 2min
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(name, help, PART_LATENCY_BOUNDS.to_vec())
    }

    pub fn with_buckets(name: &'static str, help: &'static str, bounds: Vec<f64>) -> Self {
        let hits = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name,
            help,
            bounds,
            hits,
            sum_micros: AtomicU64::new(0),
            observations: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, secs: f64) {
        self.observations.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((secs * 1e6) as u64, Ordering::Relaxed);
        for (bound, hits) in self.bounds.iter().zip(&self.hits) {
            if secs <= *bound {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "histogram");
        for (bound, hits) in self.bounds.iter().zip(&self.hits) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                hits.load(Ordering::Relaxed)
            );
        }
        let count = self.count();
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, count);
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, count);
    }
}

/// Per-client transfer metrics
pub struct TransferMetrics {
    pub parts_uploaded: Counter,
    pub parts_downloaded: Counter,
    pub bytes_uploaded: Counter,
    pub bytes_downloaded: Counter,
    pub sessions_completed: Counter,
    pub sessions_aborted: Counter,
    pub parts_in_flight: Gauge,
    pub part_duration: Histogram,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self {
            parts_uploaded: Counter::new("cosmux_parts_uploaded_total", "Parts uploaded"),
            parts_downloaded: Counter::new("cosmux_parts_downloaded_total", "Parts downloaded"),
            bytes_uploaded: Counter::new("cosmux_bytes_uploaded_total", "Bytes sent in object bodies"),
            bytes_downloaded: Counter::new(
                "cosmux_bytes_downloaded_total",
                "Bytes received in object bodies",
            ),
            sessions_completed: Counter::new(
                "cosmux_multipart_completed_total",
                "Multipart uploads completed",
            ),
            sessions_aborted: Counter::new(
                "cosmux_multipart_aborted_total",
                "Multipart uploads aborted",
            ),
            parts_in_flight: Gauge::new("cosmux_parts_in_flight", "Part transfers running"),
            part_duration: Histogram::new(
                "cosmux_part_duration_seconds",
                "Latency of one part transfer",
            ),
        }
    }

    /// Track one running part transfer until the guard drops
    pub(crate) fn part_started(&self) -> PartGuard<'_> {
        self.parts_in_flight.inc();
        PartGuard {
            metrics: self,
            start: Instant::now(),
        }
    }

    /// Render every metric in the Prometheus text format
    pub fn export(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.parts_uploaded,
            &self.parts_downloaded,
            &self.bytes_uploaded,
            &self.bytes_downloaded,
            &self.sessions_completed,
            &self.sessions_aborted,
        ] {
            counter.render(&mut out);
        }
        self.parts_in_flight.render(&mut out);
        self.part_duration.render(&mut out);
        out
    }
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge and records latency on drop
pub(crate) struct PartGuard<'a> {
    metrics: &'a TransferMetrics,
    start: Instant,
}

impl Drop for PartGuard<'_> {
    fn drop(&mut self) {
        self.metrics.parts_in_flight.dec();
        self.metrics.part_duration.observe_since(self.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");

        histogram.observe(0.02);
        histogram.observe(0.2);
        histogram.observe(200.0);

        let mut prometheus = String::new();
        histogram.render(&mut prometheus);
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"0.05\"} 1"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
    }

    #[test]
    fn test_part_guard() {
        let metrics = TransferMetrics::new();
        {
            let _guard = metrics.part_started();
            assert_eq!(metrics.parts_in_flight.get(), 1);
        }
        assert_eq!(metrics.parts_in_flight.get(), 0);
        assert_eq!(metrics.part_duration.count(), 1);
        assert!(metrics.export().contains("cosmux_parts_in_flight 0"));
    }
}
