//! Pipeline scheduler
//!
//! Walks a phase's stages in topological order, wiring each stage's inputs
//! from the emitted records of its producers and dispatching on its kind.
//! Sink writes are deferred and handed to the [`SinkExecutor`] once the
//! walk is complete.

use crate::backend::{Channel, CollectionBackend, SinkTask};
use crate::cache_policy::cache_reason;
use crate::config::EngineConfig;
use crate::dag::PipelinePhase;
use crate::emitted::{EmittedRecords, EmittedRegistry};
use crate::error::{PipelineError, Result};
use crate::join::join_inputs;
use crate::pipeline::{JoinerContext, MacroContext, PluginResolver, RuntimeContext};
use crate::router::{route, OutputTaps};
use crate::sink::{SinkExecutor, SinkOutcome};
use crate::stage::{SourceKind, StageKind, StageSpec};
use crate::stats::{collector_for, SharedCollector};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Result of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Stages visited, in visit order
    pub stages_visited: Vec<String>,
    pub sinks_completed: usize,
    /// The sink wait was abandoned through the run's cancellation token
    pub interrupted: bool,
}

/// Output of the scheduling walk, before any sink runs
pub struct ScheduledRun<B: CollectionBackend + ?Sized> {
    pub visited: Vec<String>,
    pub registry: EmittedRegistry<B>,
    pub sinks: Vec<SinkTask>,
}

/// Everything a stage visit reads
struct Visit<'a, B: CollectionBackend + ?Sized> {
    phase: &'a PipelinePhase,
    source_kind: SourceKind,
    macros: &'a MacroContext,
    partitions: &'a HashMap<String, usize>,
    plugins: &'a dyn PluginResolver<B>,
    collectors: &'a HashMap<String, SharedCollector>,
}

pub struct PipelineRunner<B: CollectionBackend> {
    backend: B,
    sink_executor: SinkExecutor,
    config: EngineConfig,
}

impl<B: CollectionBackend> PipelineRunner<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        Self {
            sink_executor: SinkExecutor::with_max_workers(config.max_sink_workers),
            backend,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Schedule the phase and wait for its sink writes.
    ///
    /// Fails with the first configuration error found during the walk, or
    /// with the first sink failure. A cancelled sink wait is reported through
    /// `RunReport::interrupted`.
    pub async fn run(
        &self,
        phase: &PipelinePhase,
        source_kind: SourceKind,
        ctx: &RuntimeContext,
        partitions: &HashMap<String, usize>,
        plugins: &dyn PluginResolver<B>,
        collectors: &HashMap<String, SharedCollector>,
    ) -> Result<RunReport> {
        let start_time = Instant::now();

        let ScheduledRun { visited, sinks, .. } = self
            .schedule(phase, source_kind, ctx, partitions, plugins, collectors)
            .inspect_err(|e| error!("Run {} failed during scheduling: {}", ctx.run_id, e))?;

        let outcome = self
            .sink_executor
            .execute(sinks, &ctx.cancellation)
            .await
            .inspect_err(|e| error!("Run {} failed: {}", ctx.run_id, e))?;

        let (sinks_completed, interrupted) = match outcome {
            SinkOutcome::Completed(n) => (n, false),
            SinkOutcome::Interrupted { .. } => (0, true),
        };

        info!(
            "Run {} finished - {} stages visited, {} sinks completed{} in {}ms",
            ctx.run_id,
            visited.len(),
            sinks_completed,
            if interrupted { " (interrupted)" } else { "" },
            start_time.elapsed().as_millis()
        );

        Ok(RunReport {
            run_id: ctx.run_id,
            stages_visited: visited,
            sinks_completed,
            interrupted,
        })
    }

    /// Walk the phase and build every stage's emitted records.
    ///
    /// Deterministic and single-threaded; no sink task runs here.
    pub fn schedule(
        &self,
        phase: &PipelinePhase,
        source_kind: SourceKind,
        ctx: &RuntimeContext,
        partitions: &HashMap<String, usize>,
        plugins: &dyn PluginResolver<B>,
        collectors: &HashMap<String, SharedCollector>,
    ) -> Result<ScheduledRun<B>> {
        let dag = phase.require_dag()?;

        info!(
            "Starting run {} ({:?}) - {} stages",
            ctx.run_id,
            source_kind,
            phase.stages().count()
        );
        if self.config.log_execution_plan {
            info!("Execution plan:\n{}", phase.execution_plan());
        }

        let macros = ctx.macro_context();
        let visit = Visit {
            phase,
            source_kind,
            macros: &macros,
            partitions,
            plugins,
            collectors,
        };

        let mut registry = EmittedRegistry::new();
        let mut sinks = Vec::new();
        let mut visited = Vec::new();

        for name in dag.topological_order() {
            // Nodes without a spec belong to another phase
            let Some(stage) = phase.stage(name) else {
                continue;
            };

            debug!(stage = %name, kind = %stage.kind, "visiting stage");
            let emitted = self.visit_stage(&visit, stage, &registry, &mut sinks)?;
            registry.record(name.clone(), emitted);
            visited.push(name.clone());
        }

        Ok(ScheduledRun {
            visited,
            registry,
            sinks,
        })
    }

    fn visit_stage(
        &self,
        visit: &Visit<'_, B>,
        stage: &StageSpec,
        registry: &EmittedRegistry<B>,
        sinks: &mut Vec<SinkTask>,
    ) -> Result<EmittedRecords<B>> {
        let phase = visit.phase;
        let name = stage.name.as_str();
        let stats = collector_for(visit.collectors, name);
        let collaborator = |e: anyhow::Error| PipelineError::collaborator(name, e);

        let inputs = gather_inputs(phase, stage, registry);
        let input = union_all(inputs.iter().map(|(_, records)| records));

        match (stage.kind, input) {
            (StageKind::ErrorTransform, _) => self.error_transform(phase, stage, registry, &stats),
            (StageKind::AlertPublisher, _) => self.publish_alerts(phase, stage, registry, &stats),
            (StageKind::Action, _) => {
                if !phase.stage_inputs(name).is_empty() {
                    return Err(unsupported(stage));
                }
                Ok(EmittedRecords::empty())
            }
            (_, None) => self.source(visit, stage, &stats),
            (StageKind::Joiner, Some(_)) => self.join(visit, stage, &inputs, &stats),
            (StageKind::Sink, Some(input)) => {
                sinks.push(self.backend.store_task(stage, &input, &stats));
                Ok(EmittedRecords::empty())
            }
            (StageKind::Connector, Some(input)) if phase.is_sink(name) => {
                sinks.push(self.backend.store_task(stage, &input, &stats));
                Ok(EmittedRecords::empty())
            }
            (StageKind::PluginSink, Some(input)) => {
                let plugin = visit.plugins.sink(name, visit.macros).map_err(collaborator)?;
                sinks.push(self.backend.plugin_store_task(stage, &input, plugin));
                Ok(EmittedRecords::empty())
            }
            (StageKind::Transform, Some(input)) => {
                let combined = self
                    .backend
                    .transform(stage, &input, &stats)
                    .map_err(collaborator)?;
                Ok(self.route(phase, stage, combined))
            }
            (StageKind::SplitterTransform, Some(input)) => {
                let combined = self
                    .backend
                    .multi_output_transform(stage, &input, &stats)
                    .map_err(collaborator)?;
                Ok(self.route(phase, stage, combined))
            }
            (StageKind::Aggregator, Some(input)) => {
                let hint = visit.partitions.get(name).copied();
                let combined = self
                    .backend
                    .aggregate(stage, &input, hint, &stats)
                    .map_err(collaborator)?;
                Ok(self.route(phase, stage, combined))
            }
            (StageKind::Compute, Some(input)) => {
                let plugin = visit.plugins.compute(name, visit.macros).map_err(collaborator)?;
                let output = self
                    .backend
                    .compute(stage, &input, plugin)
                    .map_err(collaborator)?;
                Ok(EmittedRecords::main(apply_cache_policy(phase, name, output)))
            }
            (StageKind::Windower, Some(input)) => {
                let windower = visit.plugins.windower(name, visit.macros).map_err(collaborator)?;
                let output = self
                    .backend
                    .window(stage, &input, windower)
                    .map_err(collaborator)?;
                Ok(EmittedRecords::main(apply_cache_policy(phase, name, output)))
            }
            (StageKind::BatchSource | StageKind::StreamingSource | StageKind::Connector, Some(_)) => {
                Err(unsupported(stage))
            }
        }
    }

    /// Stage with no gathered input: a source of this run, or misconfigured.
    ///
    /// Batch and streaming sources are sources by kind, so an upstream node
    /// from another phase (an action) does not disqualify them. A connector
    /// is a source only at the phase boundary.
    fn source(
        &self,
        visit: &Visit<'_, B>,
        stage: &StageSpec,
        stats: &SharedCollector,
    ) -> Result<EmittedRecords<B>> {
        let name = stage.name.as_str();
        match (stage.kind, stage.kind.source_kind()) {
            (StageKind::Connector, _) if visit.phase.is_source(name) => {}
            (_, Some(kind)) if kind == visit.source_kind => {}
            (_, Some(_)) => return Err(unsupported(stage)),
            _ => return Err(PipelineError::NoInput(name.to_string())),
        }

        let combined = self
            .backend
            .source(stage, stats)
            .map_err(|e| PipelineError::collaborator(name, e))?;
        Ok(self.route(visit.phase, stage, combined))
    }

    fn error_transform(
        &self,
        phase: &PipelinePhase,
        stage: &StageSpec,
        registry: &EmittedRegistry<B>,
        stats: &SharedCollector,
    ) -> Result<EmittedRecords<B>> {
        let producers = in_phase_inputs(phase, &stage.name)?;
        let Some(errors) = union_all(producers.iter().filter_map(|p| registry.errors_of(p))) else {
            debug!(stage = %stage.name, "no upstream error channel");
            return Ok(EmittedRecords::empty());
        };

        let combined = self
            .backend
            .error_transform(stage, &errors, stats)
            .map_err(|e| PipelineError::collaborator(&stage.name, e))?;
        Ok(self.route(phase, stage, combined))
    }

    fn publish_alerts(
        &self,
        phase: &PipelinePhase,
        stage: &StageSpec,
        registry: &EmittedRegistry<B>,
        stats: &SharedCollector,
    ) -> Result<EmittedRecords<B>> {
        let producers = in_phase_inputs(phase, &stage.name)?;
        if let Some(alerts) = union_all(producers.iter().filter_map(|p| registry.alerts_of(p))) {
            self.backend
                .publish_alerts(stage, &alerts, stats)
                .map_err(|e| PipelineError::collaborator(&stage.name, e))?;
        }
        Ok(EmittedRecords::empty())
    }

    fn join(
        &self,
        visit: &Visit<'_, B>,
        stage: &StageSpec,
        inputs: &[(String, B::Records)],
        stats: &SharedCollector,
    ) -> Result<EmittedRecords<B>> {
        let name = stage.name.as_str();
        let collaborator = |e: anyhow::Error| PipelineError::collaborator(name, e);

        let mut joiner = visit.plugins.joiner(name, visit.macros).map_err(collaborator)?;
        let joiner_ctx = JoinerContext {
            stage: name.to_string(),
            inputs: inputs.iter().map(|(input, _)| input.clone()).collect(),
            macros: visit.macros.clone(),
        };
        joiner.initialize(&joiner_ctx).map_err(collaborator)?;
        let config = joiner.join_config();

        let mut keyed = HashMap::with_capacity(inputs.len());
        for (input, records) in inputs {
            let stream = self
                .backend
                .add_join_key(stage, input, records, stats)
                .map_err(collaborator)?;
            keyed.insert(input.clone(), stream);
        }

        let joined = join_inputs(&self.backend, stage, &config, &keyed, stats)?;
        Ok(EmittedRecords::main(joined))
    }

    fn route(&self, phase: &PipelinePhase, stage: &StageSpec, combined: B::Combined) -> EmittedRecords<B> {
        let taps = OutputTaps::for_stage(phase, &stage.name);
        route(&self.backend, phase, stage, combined, taps)
    }
}

/// Producer channels feeding `stage`, sorted by producer name.
///
/// A connector on either side of the edge reads main output; otherwise the
/// producer's port for this consumer, or main output when it declared none.
/// Producers outside the phase and absent channels are skipped.
fn gather_inputs<B: CollectionBackend + ?Sized>(
    phase: &PipelinePhase,
    stage: &StageSpec,
    registry: &EmittedRegistry<B>,
) -> Vec<(String, B::Records)> {
    phase
        .stage_inputs(&stage.name)
        .into_iter()
        .filter_map(|input| {
            let producer = phase.stage(input)?;
            let port = if producer.kind == StageKind::Connector || stage.kind == StageKind::Connector {
                None
            } else {
                producer.port_for(&stage.name)
            };
            registry
                .output_of(input, port)
                .map(|records| (input.to_string(), records.clone()))
        })
        .collect()
}

/// In-phase producers of `stage`; `NoInput` when there are none
fn in_phase_inputs<'a>(phase: &'a PipelinePhase, stage: &str) -> Result<Vec<&'a str>> {
    let producers: Vec<&str> = phase
        .stage_inputs(stage)
        .into_iter()
        .filter(|input| phase.stage(input).is_some())
        .collect();

    if producers.is_empty() {
        return Err(PipelineError::NoInput(stage.to_string()));
    }
    Ok(producers)
}

fn union_all<'a, C, I>(channels: I) -> Option<C>
where
    C: Channel,
    I: IntoIterator<Item = &'a C>,
{
    let mut channels = channels.into_iter();
    let first = channels.next()?.clone();
    Some(channels.fold(first, |acc, next| acc.union(next)))
}

fn apply_cache_policy<C: Channel>(phase: &PipelinePhase, stage: &str, output: C) -> C {
    match phase.dag().and_then(|dag| cache_reason(dag, stage)) {
        Some(reason) => {
            debug!(stage = %stage, %reason, "caching stage output");
            output.cache()
        }
        None => output,
    }
}

fn unsupported(stage: &StageSpec) -> PipelineError {
    PipelineError::UnsupportedStage {
        stage: stage.name.clone(),
        kind: stage.kind.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalBackend, LocalPlugins};
    use serde_json::json;

    fn schedule(
        backend: LocalBackend,
        phase: &PipelinePhase,
    ) -> Result<ScheduledRun<LocalBackend>> {
        PipelineRunner::new(backend).schedule(
            phase,
            SourceKind::Batch,
            &RuntimeContext::new("test"),
            &HashMap::new(),
            &LocalPlugins::new(),
            &HashMap::new(),
        )
    }

    #[test]
    fn test_union_all() {
        use crate::local::LocalDataset;

        let a = LocalDataset::from_vec(vec![1]);
        let b = LocalDataset::from_vec(vec![2]);
        assert_eq!(union_all([&a, &b]).unwrap().to_vec(), vec![1, 2]);
        assert!(union_all(std::iter::empty::<&LocalDataset<i32>>()).is_none());
    }

    #[test]
    fn test_phase_without_dag_fails() {
        let phase = PipelinePhase::new(vec![StageSpec::new("src", StageKind::BatchSource)], None)
            .unwrap();
        let result = schedule(LocalBackend::new(), &phase);
        assert!(matches!(result, Err(PipelineError::MissingDag)));
    }

    #[test]
    fn test_streaming_source_in_batch_run_is_unsupported() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("src", StageKind::StreamingSource))
            .build()
            .unwrap();
        let backend = LocalBackend::new().with_source("src", vec![json!(1)]);

        let result = schedule(backend, &phase);
        assert!(matches!(
            result,
            Err(PipelineError::UnsupportedStage { ref kind, .. }) if kind == "streaming-source"
        ));
    }

    #[test]
    fn test_action_without_inputs_contributes_nothing() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("notify", StageKind::Action))
            .build()
            .unwrap();

        let scheduled = schedule(LocalBackend::new(), &phase).unwrap();
        assert_eq!(scheduled.visited, vec!["notify".to_string()]);
        assert!(scheduled.registry.get("notify").unwrap().is_empty());
        assert!(scheduled.sinks.is_empty());
    }

    #[test]
    fn test_error_transform_without_inputs_fails() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("errs", StageKind::ErrorTransform))
            .build()
            .unwrap();

        let result = schedule(LocalBackend::new(), &phase);
        assert!(matches!(result, Err(PipelineError::NoInput(ref s)) if s == "errs"));
    }

    #[test]
    fn test_backend_failure_names_the_stage() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("src", StageKind::BatchSource))
            .build()
            .unwrap();

        // no records registered for the source
        let result = schedule(LocalBackend::new(), &phase);
        assert!(matches!(
            result,
            Err(PipelineError::Collaborator { ref stage, .. }) if stage == "src"
        ));
    }
}
