//! Pipeline observability
//!
//! Histogram timings for every pipeline stage plus named counters for the
//! events worth trending (dropped chunks, cache hits, gate rejections).
//! Recording never fails and never blocks beyond a short lock; the
//! registry feeds the metrics map on diagnostic events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Well-known metric names.
pub mod metric_names {
    // Stage timings (milliseconds)
    pub const CAPTURE_MS: &str = "stage_capture_ms";
    pub const CHANGE_DETECT_MS: &str = "stage_change_detect_ms";
    pub const OCR_MS: &str = "stage_ocr_ms";
    pub const AGGREGATE_MS: &str = "stage_aggregate_ms";
    pub const DISPATCH_MS: &str = "stage_dispatch_ms";
    pub const CLOUD_MS: &str = "cloud_translate_ms";
    pub const LOCAL_BATCH_MS: &str = "local_batch_ms";
    pub const ITERATION_MS: &str = "iteration_ms";

    // Counters
    pub const CHUNKS_DROPPED: &str = "aggregator_chunks_dropped";
    pub const CLOUD_CACHE_HITS: &str = "cloud_cache_hits";
    pub const CLOUD_CACHE_MISSES: &str = "cloud_cache_misses";
    pub const GATE_REJECTIONS: &str = "text_gate_rejections";
    pub const DUPLICATES_SUPPRESSED: &str = "duplicates_suppressed";
    pub const ITERATIONS_SKIPPED_COOLDOWN: &str = "iterations_skipped_cooldown";
    pub const ITERATIONS_SKIPPED_STABILIZATION: &str = "iterations_skipped_stabilization";
    pub const ITERATIONS_CANCELLED: &str = "iterations_cancelled";
    pub const OCR_TRANSIENT_ERRORS: &str = "ocr_transient_errors";
}

/// Fixed-capacity ring of recent samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
        }
    }

    fn push(&mut self, value: f64) {
        let capacity = self.samples.len();
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }

    fn last(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let capacity = self.samples.len();
        self.samples[(self.pos + capacity - 1) % capacity]
    }
}

/// Percentile summary of one timing metric
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: usize,
}

/// Histograms and counters for the whole pipeline
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            ring_capacity: 512,
        }
    }

    /// Record a timing sample in milliseconds.
    pub fn record_ms(&self, name: &'static str, value_ms: f64) {
        let mut histograms = self.histograms.lock();
        histograms
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_ms);
    }

    /// Bump a counter by one.
    pub fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Bump a counter by `n`.
    pub fn add(&self, name: &'static str, n: u64) {
        let mut counters = self.counters.lock();
        *counters.entry(name).or_insert(0) += n;
    }

    /// Current counter value.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Percentile (0-100) of a timing metric, in milliseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// Most recent sample of a timing metric.
    pub fn last_ms(&self, name: &str) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.last())
            .unwrap_or(0.0)
    }

    /// Start a span that records into `name` when finished.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Percentile summary of every timing metric.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let histograms = self.histograms.lock();
        histograms
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_ms: ring.percentile(50.0),
                        p95_ms: ring.percentile(95.0),
                        p99_ms: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }

    /// Counter snapshot as f64, for diagnostic event payloads.
    pub fn counters_snapshot(&self) -> HashMap<String, f64> {
        self.counters
            .lock()
            .iter()
            .map(|(&name, &value)| (name.to_string(), value as f64))
            .collect()
    }
}

/// Measures elapsed wall time from creation to `finish`
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record the elapsed time and return it in milliseconds.
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.registry.record_ms(self.name, elapsed_ms);
        elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.increment(metric_names::CHUNKS_DROPPED);
        metrics.add(metric_names::CHUNKS_DROPPED, 3);
        assert_eq!(metrics.counter(metric_names::CHUNKS_DROPPED), 4);
        assert_eq!(metrics.counter(metric_names::GATE_REJECTIONS), 0);
    }

    #[test]
    fn test_percentiles_over_samples() {
        let metrics = MetricsRegistry::new();
        for v in 1..=100 {
            metrics.record_ms(metric_names::OCR_MS, v as f64);
        }
        assert!((metrics.percentile(metric_names::OCR_MS, 50.0) - 50.0).abs() <= 1.0);
        assert!((metrics.percentile(metric_names::OCR_MS, 99.0) - 99.0).abs() <= 1.0);
        assert_eq!(metrics.last_ms(metric_names::OCR_MS), 100.0);
    }

    #[test]
    fn test_span_records_on_finish() {
        let metrics = Arc::new(MetricsRegistry::new());
        let span = metrics.span(metric_names::CAPTURE_MS);
        let elapsed = span.finish();
        assert!(elapsed >= 0.0);
        assert_eq!(metrics.summary()[metric_names::CAPTURE_MS].count, 1);
    }

    #[test]
    fn test_ring_wraps_at_capacity() {
        let metrics = MetricsRegistry::new();
        for v in 0..2000 {
            metrics.record_ms(metric_names::ITERATION_MS, v as f64);
        }
        let summary = metrics.summary();
        assert_eq!(summary[metric_names::ITERATION_MS].count, 512);
        // Only recent samples survive
        assert!(metrics.percentile(metric_names::ITERATION_MS, 0.0) >= 1488.0);
    }
}
