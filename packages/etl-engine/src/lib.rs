/*
 * ETL Engine - Stage-Graph Execution for Record Pipelines
 *
 * Schedules one pipeline phase (a DAG of typed stages) over a pluggable
 * distributed-collection backend.
 *
 * Architecture:
 * - Stage Graph Model (stage kinds, ports, phase DAG)
 * - Record Channel Router (main / port / error / alert channels)
 * - Cache Policy (materialize shared results)
 * - Join Planner (required inner joins, optional outer joins)
 * - Pipeline Scheduler (topological walk, exhaustive stage dispatch)
 * - Sink Executor (bounded concurrent writes, first failure wins)
 */

// Public modules
pub mod backend;
pub mod cache_policy;
pub mod config;
pub mod dag;
pub mod emitted;
pub mod error;
pub mod join;
pub mod local;
pub mod pipeline;
pub mod records;
pub mod router;
pub mod runner;
pub mod sink;
pub mod stage;
pub mod stats;

// Re-exports
pub use backend::{Channel, CollectionBackend, FlattenFn, JoinType, SeedFn, SinkTask};
pub use cache_policy::{cache_reason, should_cache, CacheReason};
pub use config::EngineConfig;
pub use dag::{Connection, Dag, PhaseBuilder, PhaseSpec, PipelinePhase};
pub use emitted::{EmittedRecords, EmittedRegistry, StageOutput};
pub use error::{ErrorCategory, PipelineError, Result};
pub use join::{join_inputs, JoinConfig, JoinPlan, JoinStep, JoinStepKind};
pub use local::{LocalBackend, LocalDataset, LocalPlugins, LocalStore};
pub use pipeline::{
    JoinerContext, JoinerPlugin, MacroContext, PluginResolver, RuntimeContext,
};
pub use records::{Alert, ErrorRecord, JoinElement, JoinRow, JoinValue, Record, RecordInfo};
pub use router::{route, OutputTaps};
pub use runner::{PipelineRunner, RunReport, ScheduledRun};
pub use sink::{SinkExecutor, SinkOutcome};
pub use stage::{PortSpec, SourceKind, StageKind, StageSpec};
pub use stats::{
    collector_for, CountingCollector, NoopCollector, SharedCollector, StageMetrics,
    StatisticsCollector,
};
