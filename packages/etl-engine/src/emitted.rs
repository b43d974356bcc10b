//! Emitted records registry
//!
//! Every visited stage registers exactly one immutable [`EmittedRecords`]:
//! its normal output plus the error and alert channels its consumers tap.

use crate::backend::CollectionBackend;
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Normal output of a stage: nothing, one main channel, or one channel per port
#[derive(Debug, Clone)]
pub enum StageOutput<R> {
    Empty,
    Main(R),
    Ports(BTreeMap<String, R>),
}

impl<R> StageOutput<R> {
    pub fn main(&self) -> Option<&R> {
        match self {
            StageOutput::Main(r) => Some(r),
            _ => None,
        }
    }

    pub fn port(&self, port: &str) -> Option<&R> {
        match self {
            StageOutput::Ports(ports) => ports.get(port),
            _ => None,
        }
    }

    pub fn ports(&self) -> Option<&BTreeMap<String, R>> {
        match self {
            StageOutput::Ports(ports) => Some(ports),
            _ => None,
        }
    }
}

/// Channels a stage produced. Built once per visited stage and never mutated.
pub struct EmittedRecords<B: CollectionBackend + ?Sized> {
    pub output: StageOutput<B::Records>,
    pub errors: Option<B::Errors>,
    pub alerts: Option<B::Alerts>,
}

impl<B: CollectionBackend + ?Sized> EmittedRecords<B> {
    pub fn empty() -> Self {
        Self {
            output: StageOutput::Empty,
            errors: None,
            alerts: None,
        }
    }

    pub fn main(records: B::Records) -> Self {
        Self {
            output: StageOutput::Main(records),
            errors: None,
            alerts: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.output, StageOutput::Empty) && self.errors.is_none() && self.alerts.is_none()
    }
}

impl<B: CollectionBackend + ?Sized> Clone for EmittedRecords<B> {
    fn clone(&self) -> Self {
        Self {
            output: self.output.clone(),
            errors: self.errors.clone(),
            alerts: self.alerts.clone(),
        }
    }
}

/// Emitted records of every visited stage, in visit order.
///
/// Single writer per key: the scheduler records a stage's entry during that
/// stage's own visit, and stages are visited in topological order, so every
/// entry is complete before any downstream stage reads it. The registry is
/// therefore a plain map with no synchronization; it lives for one run.
pub struct EmittedRegistry<B: CollectionBackend + ?Sized> {
    entries: IndexMap<String, EmittedRecords<B>>,
}

impl<B: CollectionBackend + ?Sized> Default for EmittedRegistry<B> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<B: CollectionBackend + ?Sized> EmittedRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: impl Into<String>, emitted: EmittedRecords<B>) {
        let stage = stage.into();
        debug_assert!(
            !self.entries.contains_key(&stage),
            "stage '{}' recorded twice",
            stage
        );
        self.entries.insert(stage, emitted);
    }

    pub fn get(&self, stage: &str) -> Option<&EmittedRecords<B>> {
        self.entries.get(stage)
    }

    /// Records `producer` emitted on `port`, or its main output when `port` is `None`
    pub fn output_of(&self, producer: &str, port: Option<&str>) -> Option<&B::Records> {
        let emitted = self.entries.get(producer)?;
        match port {
            Some(port) => emitted.output.port(port),
            None => emitted.output.main(),
        }
    }

    pub fn errors_of(&self, producer: &str) -> Option<&B::Errors> {
        self.entries.get(producer)?.errors.as_ref()
    }

    pub fn alerts_of(&self, producer: &str) -> Option<&B::Alerts> {
        self.entries.get(producer)?.alerts.as_ref()
    }

    /// Visited stage names, in visit order
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalBackend, LocalDataset};
    use serde_json::json;

    #[test]
    fn test_registry_lookup_by_port() {
        let mut registry: EmittedRegistry<LocalBackend> = EmittedRegistry::new();

        let mut ports = BTreeMap::new();
        ports.insert("p1".to_string(), LocalDataset::from_vec(vec![json!(1)]));
        registry.record(
            "split",
            EmittedRecords {
                output: StageOutput::Ports(ports),
                errors: None,
                alerts: None,
            },
        );
        registry.record(
            "t",
            EmittedRecords::main(LocalDataset::from_vec(vec![json!(2)])),
        );

        assert!(registry.output_of("split", Some("p1")).is_some());
        assert!(registry.output_of("split", None).is_none());
        assert!(registry.output_of("t", None).is_some());
        assert!(registry.output_of("t", Some("p1")).is_none());
        assert!(registry.output_of("missing", None).is_none());
        assert!(registry.errors_of("t").is_none());
    }

    #[test]
    fn test_registry_preserves_visit_order() {
        let mut registry: EmittedRegistry<LocalBackend> = EmittedRegistry::new();
        for stage in ["src", "b", "a"] {
            registry.record(stage, EmittedRecords::empty());
        }

        assert_eq!(registry.stages().collect::<Vec<_>>(), vec!["src", "b", "a"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("b").unwrap().is_empty());
    }
}
