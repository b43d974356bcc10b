//! Stage specifications: kinds, source kinds and named output ports

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of source a run reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Batch,
    Streaming,
}

/// Stage kind. Closed set: the scheduler dispatches on it with an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    BatchSource,
    StreamingSource,
    /// Boundary pass-through between separately scheduled phases
    Connector,
    Sink,
    Transform,
    SplitterTransform,
    ErrorTransform,
    AlertPublisher,
    /// Single-output analytical transform backed by an instantiated plugin
    Compute,
    /// Write through an instantiated plugin instead of a fixed sink
    PluginSink,
    Aggregator,
    Joiner,
    Windower,
    /// Runs in its own phase; appears here only as an upstream reference
    Action,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::BatchSource => "batch-source",
            StageKind::StreamingSource => "streaming-source",
            StageKind::Connector => "connector",
            StageKind::Sink => "sink",
            StageKind::Transform => "transform",
            StageKind::SplitterTransform => "splitter-transform",
            StageKind::ErrorTransform => "error-transform",
            StageKind::AlertPublisher => "alert-publisher",
            StageKind::Compute => "compute",
            StageKind::PluginSink => "plugin-sink",
            StageKind::Aggregator => "aggregator",
            StageKind::Joiner => "joiner",
            StageKind::Windower => "windower",
            StageKind::Action => "action",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch-source" => Ok(StageKind::BatchSource),
            "streaming-source" => Ok(StageKind::StreamingSource),
            "connector" => Ok(StageKind::Connector),
            "sink" => Ok(StageKind::Sink),
            "transform" => Ok(StageKind::Transform),
            "splitter-transform" => Ok(StageKind::SplitterTransform),
            "error-transform" => Ok(StageKind::ErrorTransform),
            "alert-publisher" => Ok(StageKind::AlertPublisher),
            "compute" => Ok(StageKind::Compute),
            "plugin-sink" => Ok(StageKind::PluginSink),
            "aggregator" => Ok(StageKind::Aggregator),
            "joiner" => Ok(StageKind::Joiner),
            "windower" => Ok(StageKind::Windower),
            "action" => Ok(StageKind::Action),
            _ => Err(PipelineError::UnsupportedStageKind(s.to_string())),
        }
    }

    /// Source kind this stage reads, if it is a source plugin
    pub fn source_kind(&self) -> Option<SourceKind> {
        match self {
            StageKind::BatchSource => Some(SourceKind::Batch),
            StageKind::StreamingSource => Some(SourceKind::Streaming),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named output port a stage routes to one of its consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: String,
}

/// Stage specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    /// Downstream stage name -> port. When empty, every consumer reads main
    /// output. Once a port is declared the stage publishes only port channels,
    /// and each consumer other than an error transform or alert publisher
    /// must be listed.
    #[serde(default)]
    pub output_ports: BTreeMap<String, PortSpec>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            output_ports: BTreeMap::new(),
        }
    }

    /// Route records on `port` to the downstream stage `consumer`
    pub fn with_port(mut self, consumer: impl Into<String>, port: impl Into<String>) -> Self {
        self.output_ports
            .insert(consumer.into(), PortSpec { port: port.into() });
        self
    }

    /// Port declared for `consumer`, or `None` when it reads main output
    pub fn port_for(&self, consumer: &str) -> Option<&str> {
        self.output_ports.get(consumer).map(|p| p.port.as_str())
    }

    /// Distinct declared port names
    pub fn port_names(&self) -> BTreeSet<&str> {
        self.output_ports.values().map(|p| p.port.as_str()).collect()
    }
}
