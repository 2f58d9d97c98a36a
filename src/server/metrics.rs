//! Service metrics
//!
//! Atomic counters, gauges, and histograms with Prometheus text exposition.
//! The metric names and label sets here are contractual: dashboards and
//! alerts key off them.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram for latency tracking
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries in microseconds
    buckets: Vec<u64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Overflow count (values exceeding all bucket boundaries)
    overflow: AtomicU64,
    /// Sum of all values (for mean calculation)
    sum: AtomicU64,
    /// Total count
    count: AtomicU64,
}

impl Histogram {
    /// Histogram with the given bucket boundaries in microseconds.
    pub fn from_micros(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Default request-latency buckets: 1ms to 5s.
    pub fn new_latency() -> Self {
        Self::from_micros(vec![
            1000, 5000, 10000, 25000, 50000, 100000, 250000, 500000, 1000000, 5000000,
        ])
    }

    /// Record a duration
    pub fn observe(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &boundary) in self.buckets.iter().enumerate() {
            if micros <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    fn bucket_boundaries(&self) -> &[u64] {
        &self.buckets
    }

    fn bucket_counts(&self) -> Vec<u64> {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    fn sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new_latency()
    }
}

/// Counter family keyed by label values
#[derive(Debug)]
pub struct LabeledCounter {
    label_names: &'static [&'static str],
    children: DashMap<Vec<String>, Counter>,
}

impl LabeledCounter {
    pub fn new(label_names: &'static [&'static str]) -> Self {
        Self {
            label_names,
            children: DashMap::new(),
        }
    }

    pub fn inc(&self, labels: &[&str]) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.children.entry(key).or_default().inc();
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.children.get(&key).map(|c| c.get()).unwrap_or(0)
    }
}

/// Histogram family keyed by label values
#[derive(Debug)]
pub struct LabeledHistogram {
    label_names: &'static [&'static str],
    bucket_micros: Vec<u64>,
    children: DashMap<Vec<String>, Histogram>,
}

impl LabeledHistogram {
    pub fn new(label_names: &'static [&'static str], bucket_micros: Vec<u64>) -> Self {
        Self {
            label_names,
            bucket_micros,
            children: DashMap::new(),
        }
    }

    pub fn observe(&self, labels: &[&str], duration: Duration) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.children
            .entry(key)
            .or_insert_with(|| Histogram::from_micros(self.bucket_micros.clone()))
            .observe(duration);
    }

    pub fn count(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.children.get(&key).map(|h| h.count()).unwrap_or(0)
    }
}

/// All service metrics
#[derive(Debug)]
pub struct CrawlMetrics {
    /// Total HTTP requests by method, route, and status
    pub http_requests_total: LabeledCounter,
    /// HTTP request latency by method, route, and status
    pub http_request_duration_seconds: LabeledHistogram,
    /// Current crawl queue depth, sampled periodically
    pub urls_in_queue: Gauge,
    /// Crawl attempts by outcome and error type
    pub crawls_total: LabeledCounter,
    /// Crawl latency by target domain
    pub crawl_duration_seconds: LabeledHistogram,
}

impl CrawlMetrics {
    pub fn new() -> Self {
        // Crawls take seconds to minutes, so their buckets run 1s to 120s;
        // HTTP requests use the default latency buckets.
        let crawl_buckets: Vec<u64> = [1u64, 5, 10, 15, 30, 60, 120]
            .iter()
            .map(|s| s * 1_000_000)
            .collect();

        Self {
            http_requests_total: LabeledCounter::new(&["method", "path", "status"]),
            http_request_duration_seconds: LabeledHistogram::new(
                &["method", "path", "status"],
                Histogram::new_latency().buckets.clone(),
            ),
            urls_in_queue: Gauge::new(),
            crawls_total: LabeledCounter::new(&["status", "error_type"]),
            crawl_duration_seconds: LabeledHistogram::new(&["domain"], crawl_buckets),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Export all metrics in Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        write_labeled_counter(
            &mut out,
            "http_requests_total",
            "Total number of HTTP requests.",
            &self.http_requests_total,
        );
        write_labeled_histogram(
            &mut out,
            "http_request_duration_seconds",
            "Duration of HTTP requests.",
            &self.http_request_duration_seconds,
        );
        write_gauge(
            &mut out,
            "urls_in_queue",
            "Current number of URLs in the crawl queue.",
            self.urls_in_queue.get(),
        );
        write_labeled_counter(
            &mut out,
            "crawls_total",
            "Total number of crawl attempts.",
            &self.crawls_total,
        );
        write_labeled_histogram(
            &mut out,
            "crawl_duration_seconds",
            "Duration of crawl operations.",
            &self.crawl_duration_seconds,
        );

        out
    }
}

impl Default for CrawlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

fn write_labeled_counter(out: &mut String, name: &str, help: &str, counter: &LabeledCounter) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);

    let mut entries: Vec<(Vec<String>, u64)> = counter
        .children
        .iter()
        .map(|e| (e.key().clone(), e.value().get()))
        .collect();
    entries.sort();

    for (values, count) in entries {
        let _ = writeln!(
            out,
            "{}{} {}",
            name,
            format_labels(counter.label_names, &values, None),
            count
        );
    }
    let _ = writeln!(out);
}

fn write_labeled_histogram(out: &mut String, name: &str, help: &str, hist: &LabeledHistogram) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} histogram", name);

    let mut keys: Vec<Vec<String>> = hist.children.iter().map(|e| e.key().clone()).collect();
    keys.sort();

    for values in keys {
        let Some(child) = hist.children.get(&values) else {
            continue;
        };
        let boundaries = child.bucket_boundaries();
        let counts = child.bucket_counts();

        // Cumulative le buckets, then the +Inf bucket with the total count.
        let mut cumulative: u64 = 0;
        for (i, &boundary) in boundaries.iter().enumerate() {
            cumulative += counts[i];
            let le_seconds = boundary as f64 / 1_000_000.0;
            let le = format!("{:.3}", le_seconds);
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                name,
                format_labels(hist.label_names, &values, Some(&le)),
                cumulative
            );
        }
        let total = child.count();
        let _ = writeln!(
            out,
            "{}_bucket{} {}",
            name,
            format_labels(hist.label_names, &values, Some("+Inf")),
            total
        );

        let sum_seconds = child.sum_micros() as f64 / 1_000_000.0;
        let _ = writeln!(
            out,
            "{}_sum{} {:.6}",
            name,
            format_labels(hist.label_names, &values, None),
            sum_seconds
        );
        let _ = writeln!(
            out,
            "{}_count{} {}",
            name,
            format_labels(hist.label_names, &values, None),
            total
        );
    }
    let _ = writeln!(out);
}

/// Render a `{a="x",b="y"}` label block, optionally with a trailing `le`.
fn format_labels(names: &[&str], values: &[String], le: Option<&str>) -> String {
    let mut parts: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, escape_label_value(value)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{}\"", le));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
