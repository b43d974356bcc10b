//! Runtime context and plugin seams
//!
//! `RuntimeContext` carries the run's identity, macros and cancellation token.
//! Plugin-backed stages (compute, windower, plugin sink, joiner) are resolved
//! through a [`PluginResolver`].

use crate::backend::CollectionBackend;
use crate::join::JoinConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context of one scheduling run
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub run_id: Uuid,
    pub namespace: String,
    pub logical_start_time: DateTime<Utc>,
    /// Runtime arguments visible to macros
    pub arguments: HashMap<String, String>,
    /// Fired to abandon the wait for deferred sink writes
    pub cancellation: CancellationToken,
}

impl RuntimeContext {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            namespace: namespace.into(),
            logical_start_time: Utc::now(),
            arguments: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_logical_start_time(mut self, time: DateTime<Utc>) -> Self {
        self.logical_start_time = time;
        self
    }

    /// Macro context handed to the plugin resolver
    pub fn macro_context(&self) -> MacroContext {
        MacroContext {
            namespace: self.namespace.clone(),
            logical_start_time: self.logical_start_time,
            arguments: Arc::new(self.arguments.clone()),
        }
    }
}

/// Values macros in plugin properties may resolve against.
/// Expansion itself belongs to the plugin resolver.
#[derive(Debug, Clone)]
pub struct MacroContext {
    pub namespace: String,
    pub logical_start_time: DateTime<Utc>,
    pub arguments: Arc<HashMap<String, String>>,
}

impl MacroContext {
    /// Look up a macro key. `logicalStartTime` resolves to the run's logical start (RFC 3339).
    pub fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "logicalStartTime" => Some(self.logical_start_time.to_rfc3339()),
            "namespace" => Some(self.namespace.clone()),
            _ => self.arguments.get(key).cloned(),
        }
    }
}

/// Context passed to a joiner plugin before its join config is read
#[derive(Debug, Clone)]
pub struct JoinerContext {
    pub stage: String,
    /// Connected input stages, sorted by name
    pub inputs: Vec<String>,
    pub macros: MacroContext,
}

/// Joiner plugin instance
pub trait JoinerPlugin: Send {
    fn initialize(&mut self, _ctx: &JoinerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn join_config(&self) -> JoinConfig;
}

/// Instantiates plugins for stages that need one (stage name + macro context → instance)
pub trait PluginResolver<B: CollectionBackend + ?Sized>: Send + Sync {
    fn compute(&self, stage: &str, macros: &MacroContext) -> anyhow::Result<B::Compute>;

    fn sink(&self, stage: &str, macros: &MacroContext) -> anyhow::Result<B::SinkPlugin>;

    fn windower(&self, stage: &str, macros: &MacroContext) -> anyhow::Result<B::Windower>;

    fn joiner(&self, stage: &str, macros: &MacroContext) -> anyhow::Result<Box<dyn JoinerPlugin>>;
}
