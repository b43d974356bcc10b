//! Per-stage statistics collectors

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-stage record counters, fed by the collection backend
pub trait StatisticsCollector: Send + Sync {
    fn incr_input_records(&self, count: u64);
    fn incr_output_records(&self, count: u64);
    fn incr_error_records(&self, count: u64);
}

pub type SharedCollector = Arc<dyn StatisticsCollector>;

/// Used for stages the caller supplied no collector for
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl StatisticsCollector for NoopCollector {
    fn incr_input_records(&self, _count: u64) {}
    fn incr_output_records(&self, _count: u64) {}
    fn incr_error_records(&self, _count: u64) {}
}

/// Atomic counters; safe to update from sink workers
#[derive(Debug, Default)]
pub struct CountingCollector {
    input_records: AtomicU64,
    output_records: AtomicU64,
    error_records: AtomicU64,
}

impl CountingCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> StageMetrics {
        StageMetrics {
            input_records: self.input_records.load(Ordering::Relaxed),
            output_records: self.output_records.load(Ordering::Relaxed),
            error_records: self.error_records.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsCollector for CountingCollector {
    fn incr_input_records(&self, count: u64) {
        self.input_records.fetch_add(count, Ordering::Relaxed);
    }

    fn incr_output_records(&self, count: u64) {
        self.output_records.fetch_add(count, Ordering::Relaxed);
    }

    fn incr_error_records(&self, count: u64) {
        self.error_records.fetch_add(count, Ordering::Relaxed);
    }
}

/// Stage metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub input_records: u64,
    pub output_records: u64,
    pub error_records: u64,
}

/// Collector registered for `stage`, or a no-op collector
pub fn collector_for(collectors: &HashMap<String, SharedCollector>, stage: &str) -> SharedCollector {
    collectors
        .get(stage)
        .cloned()
        .unwrap_or_else(|| Arc::new(NoopCollector))
}
