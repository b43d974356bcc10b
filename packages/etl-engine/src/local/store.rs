use crate::records::{Alert, Record};
use dashmap::DashMap;

/// Records written by sinks and alerts published, keyed by stage.
///
/// Sink tasks write from blocking workers concurrently.
#[derive(Debug, Default)]
pub struct LocalStore {
    written: DashMap<String, Vec<Record>>,
    alerts: DashMap<String, Vec<Alert>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, stage: &str, records: &[Record]) {
        self.written
            .entry(stage.to_string())
            .or_default()
            .extend(records.iter().cloned());
    }

    pub fn publish(&self, stage: &str, alerts: &[Alert]) {
        self.alerts
            .entry(stage.to_string())
            .or_default()
            .extend(alerts.iter().cloned());
    }

    /// Records written by `stage`, empty if it never wrote
    pub fn records(&self, stage: &str) -> Vec<Record> {
        self.written
            .get(stage)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn alerts(&self, stage: &str) -> Vec<Alert> {
        self.alerts
            .get(stage)
            .map(|a| a.value().clone())
            .unwrap_or_default()
    }

    pub fn has_written(&self, stage: &str) -> bool {
        self.written.contains_key(stage)
    }

    /// Stages that wrote at least once, sorted
    pub fn sinks(&self) -> Vec<String> {
        let mut sinks: Vec<String> = self.written.iter().map(|e| e.key().clone()).collect();
        sinks.sort();
        sinks
    }
}
