//! Distributed-collection backend abstraction
//!
//! The engine never touches records directly: every operator (transform,
//! filter, join, write) is delegated to a [`CollectionBackend`]. Channel handles
//! are opaque associated types; the engine only unions them, caches them and
//! passes them back to the backend.

use crate::records::{JoinRow, Record};
use crate::stage::StageSpec;
use crate::stats::SharedCollector;
use std::sync::Arc;

/// Opaque handle to a distributed collection
pub trait Channel: Clone + Send + Sync + 'static {
    fn union(&self, other: &Self) -> Self;

    /// Mark the collection materialized. Idempotent; never changes contents.
    fn cache(&self) -> Self;
}

/// Join flavour applied by one join step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Both sides present
    Inner,
    /// Left side always present, right side may be absent
    LeftOuter,
    /// Either side may be absent (never both)
    FullOuter,
}

/// Turns a keyed record into the first joined row
pub type SeedFn = Arc<dyn Fn(&Record) -> JoinRow + Send + Sync>;

/// Combines the joined row so far with the matched record of the next input
pub type FlattenFn = Arc<dyn Fn(Option<&JoinRow>, Option<&Record>) -> JoinRow + Send + Sync>;

/// Deferred zero-input write unit
pub struct SinkTask {
    stage: String,
    run: Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>,
}

impl SinkTask {
    pub fn new<F>(stage: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            stage: stage.into(),
            run: Box::new(run),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn run(self) -> anyhow::Result<()> {
        (self.run)()
    }
}

impl std::fmt::Debug for SinkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkTask")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// Collection operators the scheduler composes.
///
/// Operators returning `anyhow::Result` may fail at plan time; the scheduler
/// reports such failures against the stage being visited.
pub trait CollectionBackend: Send + Sync {
    /// Plain records
    type Records: Channel;
    /// Records tagged with their channel (`RecordInfo`)
    type Combined: Channel;
    type Errors: Channel;
    type Alerts: Channel;
    /// Records paired with their join key
    type Keyed: Channel;
    /// Join key paired with the joined row
    type Joined: Channel;

    type Compute: Send;
    type SinkPlugin: Send;
    type Windower: Send;

    // ── stage operators ────────────────────────────────────────────────

    fn source(&self, stage: &StageSpec, stats: &SharedCollector) -> anyhow::Result<Self::Combined>;

    fn transform(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined>;

    fn multi_output_transform(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined>;

    fn error_transform(
        &self,
        stage: &StageSpec,
        errors: &Self::Errors,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined>;

    /// `partitions == None` uses the backend default
    fn aggregate(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        partitions: Option<usize>,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined>;

    fn compute(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        plugin: Self::Compute,
    ) -> anyhow::Result<Self::Records>;

    fn window(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        windower: Self::Windower,
    ) -> anyhow::Result<Self::Records>;

    fn publish_alerts(
        &self,
        stage: &StageSpec,
        alerts: &Self::Alerts,
        stats: &SharedCollector,
    ) -> anyhow::Result<()>;

    /// Write task for a fixed sink kind (sink or connector sink)
    fn store_task(&self, stage: &StageSpec, input: &Self::Records, stats: &SharedCollector)
        -> SinkTask;

    /// Write task through an instantiated sink plugin
    fn plugin_store_task(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        plugin: Self::SinkPlugin,
    ) -> SinkTask;

    // ── channel filters ────────────────────────────────────────────────

    fn error_records(&self, stage: &StageSpec, combined: &Self::Combined) -> Self::Errors;

    fn alert_records(&self, stage: &StageSpec, combined: &Self::Combined) -> Self::Alerts;

    /// Output records; `port == None` keeps all outputs, `Some` only that port
    fn output_records(
        &self,
        stage: &StageSpec,
        combined: &Self::Combined,
        port: Option<&str>,
    ) -> Self::Records;

    // ── join primitives ────────────────────────────────────────────────

    fn add_join_key(
        &self,
        stage: &StageSpec,
        input_stage: &str,
        input: &Self::Records,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Keyed>;

    /// Map values of a keyed collection into joined rows
    fn seed_join(&self, keyed: &Self::Keyed, seed: &SeedFn) -> Self::Joined;

    /// Join on key and flatten each matched pair.
    ///
    /// For every key the backend calls `flatten` once per matched
    /// (left row, right record) pair, passing `None` for an absent side as
    /// `join_type` allows.
    fn join(
        &self,
        left: &Self::Joined,
        right: &Self::Keyed,
        join_type: JoinType,
        partitions: Option<usize>,
        flatten: &FlattenFn,
    ) -> Self::Joined;

    fn merge_join_results(
        &self,
        stage: &StageSpec,
        joined: &Self::Joined,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Records>;
}
