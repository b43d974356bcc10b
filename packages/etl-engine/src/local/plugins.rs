use crate::join::JoinConfig;
use crate::local::backend::{ComputeFn, LocalBackend, SinkFn, WindowFn};
use crate::pipeline::{JoinerContext, JoinerPlugin, MacroContext, PluginResolver};
use crate::records::Record;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Plugin registry for the local backend, keyed by stage name
#[derive(Clone, Default)]
pub struct LocalPlugins {
    computes: HashMap<String, ComputeFn>,
    sinks: HashMap<String, SinkFn>,
    windowers: HashMap<String, WindowFn>,
    joiners: HashMap<String, JoinConfig>,
}

impl LocalPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compute<F>(mut self, stage: &str, f: F) -> Self
    where
        F: Fn(&[Record]) -> anyhow::Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.computes.insert(stage.to_string(), Arc::new(f));
        self
    }

    pub fn with_sink<F>(mut self, stage: &str, f: F) -> Self
    where
        F: Fn(&[Record]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.sinks.insert(stage.to_string(), Arc::new(f));
        self
    }

    pub fn with_windower<F>(mut self, stage: &str, f: F) -> Self
    where
        F: Fn(&[Record]) -> anyhow::Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.windowers.insert(stage.to_string(), Arc::new(f));
        self
    }

    pub fn with_joiner(mut self, stage: &str, config: JoinConfig) -> Self {
        self.joiners.insert(stage.to_string(), config);
        self
    }
}

impl PluginResolver<LocalBackend> for LocalPlugins {
    fn compute(&self, stage: &str, _macros: &MacroContext) -> anyhow::Result<ComputeFn> {
        self.computes
            .get(stage)
            .cloned()
            .ok_or_else(|| anyhow!("no compute plugin registered for stage '{}'", stage))
    }

    fn sink(&self, stage: &str, _macros: &MacroContext) -> anyhow::Result<SinkFn> {
        self.sinks
            .get(stage)
            .cloned()
            .ok_or_else(|| anyhow!("no sink plugin registered for stage '{}'", stage))
    }

    fn windower(&self, stage: &str, _macros: &MacroContext) -> anyhow::Result<WindowFn> {
        self.windowers
            .get(stage)
            .cloned()
            .ok_or_else(|| anyhow!("no windower registered for stage '{}'", stage))
    }

    fn joiner(&self, stage: &str, _macros: &MacroContext) -> anyhow::Result<Box<dyn JoinerPlugin>> {
        let config = self
            .joiners
            .get(stage)
            .cloned()
            .ok_or_else(|| anyhow!("no joiner registered for stage '{}'", stage))?;
        Ok(Box::new(StaticJoiner::new(config)))
    }
}

/// Joiner with a fixed join config
#[derive(Debug, Clone)]
pub struct StaticJoiner {
    config: JoinConfig,
}

impl StaticJoiner {
    pub fn new(config: JoinConfig) -> Self {
        Self { config }
    }
}

impl JoinerPlugin for StaticJoiner {
    fn initialize(&mut self, ctx: &JoinerContext) -> anyhow::Result<()> {
        debug!(
            stage = %ctx.stage,
            inputs = ?ctx.inputs,
            required = ?self.config.required,
            "joiner initialized"
        );
        Ok(())
    }

    fn join_config(&self) -> JoinConfig {
        self.config.clone()
    }
}
