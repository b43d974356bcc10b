//! Local collection backend
//!
//! Eager, in-memory rendition of every collection operator. Per-record work
//! fans out over rayon; sink writes land in a shared [`LocalStore`].
//!
//! Stage behaviour is registered per stage name:
//! - sources: the records a source stage emits
//! - transforms / error transforms: record → tagged outputs (identity when absent)
//! - aggregations: group key + reducer
//! - join keys: per joiner, optionally per joiner input

use crate::backend::{CollectionBackend, FlattenFn, JoinType, SeedFn, SinkTask};
use crate::local::dataset::LocalDataset;
use crate::local::store::LocalStore;
use crate::records::{Alert, ErrorRecord, JoinRow, Record, RecordInfo};
use crate::stage::StageSpec;
use crate::stats::SharedCollector;
use anyhow::anyhow;
use dashmap::DashMap;
use rayon::prelude::*;
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub type TransformFn = Arc<dyn Fn(&Record) -> Vec<RecordInfo> + Send + Sync>;
pub type ErrorTransformFn = Arc<dyn Fn(&ErrorRecord) -> Vec<RecordInfo> + Send + Sync>;
pub type KeyFn = Arc<dyn Fn(&Record) -> anyhow::Result<String> + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(&str, &[Record]) -> Record + Send + Sync>;
pub type ComputeFn = Arc<dyn Fn(&[Record]) -> anyhow::Result<Vec<Record>> + Send + Sync>;
pub type WindowFn = Arc<dyn Fn(&[Record]) -> anyhow::Result<Vec<Record>> + Send + Sync>;
pub type SinkFn = Arc<dyn Fn(&[Record]) -> anyhow::Result<()> + Send + Sync>;

/// Group-by-key aggregation of an aggregator stage
#[derive(Clone)]
pub struct Aggregation {
    pub group_key: KeyFn,
    pub reduce: ReduceFn,
}

impl Aggregation {
    pub fn new<K, R>(group_key: K, reduce: R) -> Self
    where
        K: Fn(&Record) -> anyhow::Result<String> + Send + Sync + 'static,
        R: Fn(&str, &[Record]) -> Record + Send + Sync + 'static,
    {
        Self {
            group_key: Arc::new(group_key),
            reduce: Arc::new(reduce),
        }
    }

    /// One `{<field>: key, "count": n}` record per distinct value of `field`
    pub fn count_by(field: &str) -> Self {
        let name = field.to_string();
        Self {
            group_key: field_key(field),
            reduce: Arc::new(move |key: &str, records: &[Record]| {
                let mut out = Map::new();
                out.insert(name.clone(), Record::String(key.to_string()));
                out.insert("count".to_string(), json!(records.len()));
                Record::Object(out)
            }),
        }
    }
}

pub struct LocalBackend {
    sources: HashMap<String, Vec<RecordInfo>>,
    transforms: HashMap<String, TransformFn>,
    error_transforms: HashMap<String, ErrorTransformFn>,
    aggregations: HashMap<String, Aggregation>,
    join_keys: HashMap<String, KeyFn>,
    input_join_keys: HashMap<(String, String), KeyFn>,
    sink_failures: HashMap<String, String>,
    default_partitions: usize,
    partitions_used: DashMap<String, usize>,
    split_from_cache: DashMap<String, bool>,
    store: Arc<LocalStore>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
            transforms: HashMap::new(),
            error_transforms: HashMap::new(),
            aggregations: HashMap::new(),
            join_keys: HashMap::new(),
            input_join_keys: HashMap::new(),
            sink_failures: HashMap::new(),
            default_partitions: num_cpus::get().max(1),
            partitions_used: DashMap::new(),
            split_from_cache: DashMap::new(),
            store: Arc::new(LocalStore::new()),
        }
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the source stage emits on its main output
    pub fn with_source<I>(self, stage: &str, records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let infos = records.into_iter().map(RecordInfo::output).collect();
        self.with_source_infos(stage, infos)
    }

    /// Tagged records (outputs, errors, alerts) the source stage emits
    pub fn with_source_infos(mut self, stage: &str, infos: Vec<RecordInfo>) -> Self {
        self.sources.insert(stage.to_string(), infos);
        self
    }

    /// Transform or splitter function; identity when none is registered
    pub fn with_transform<F>(mut self, stage: &str, f: F) -> Self
    where
        F: Fn(&Record) -> Vec<RecordInfo> + Send + Sync + 'static,
    {
        self.transforms.insert(stage.to_string(), Arc::new(f));
        self
    }

    pub fn with_error_transform<F>(mut self, stage: &str, f: F) -> Self
    where
        F: Fn(&ErrorRecord) -> Vec<RecordInfo> + Send + Sync + 'static,
    {
        self.error_transforms.insert(stage.to_string(), Arc::new(f));
        self
    }

    pub fn with_aggregation(mut self, stage: &str, aggregation: Aggregation) -> Self {
        self.aggregations.insert(stage.to_string(), aggregation);
        self
    }

    /// Join key for every input of `joiner`
    pub fn with_join_key<F>(mut self, joiner: &str, f: F) -> Self
    where
        F: Fn(&Record) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.join_keys.insert(joiner.to_string(), Arc::new(f));
        self
    }

    /// Join key for one input of `joiner`; takes precedence over `with_join_key`
    pub fn with_input_join_key<F>(mut self, joiner: &str, input: &str, f: F) -> Self
    where
        F: Fn(&Record) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.input_join_keys
            .insert((joiner.to_string(), input.to_string()), Arc::new(f));
        self
    }

    /// Join every input of `joiner` on the value of `field`
    pub fn with_join_field(mut self, joiner: &str, field: &str) -> Self {
        self.join_keys.insert(joiner.to_string(), field_key(field));
        self
    }

    /// Make the write task of sink `stage` fail with `message`
    pub fn with_sink_failure(mut self, stage: &str, message: &str) -> Self {
        self.sink_failures
            .insert(stage.to_string(), message.to_string());
        self
    }

    pub fn with_default_partitions(mut self, partitions: usize) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    pub fn default_partitions(&self) -> usize {
        self.default_partitions
    }

    /// Partition count the last aggregation of `stage` ran with
    pub fn partitions_used(&self, stage: &str) -> Option<usize> {
        self.partitions_used.get(stage).map(|p| *p.value())
    }

    /// Whether the last channel split of `stage` read a cached combined stream
    pub fn split_from_cache(&self, stage: &str) -> Option<bool> {
        self.split_from_cache.get(stage).map(|c| *c.value())
    }

    fn record_split(&self, stage: &StageSpec, combined: &LocalDataset<RecordInfo>) {
        self.split_from_cache
            .insert(stage.name.clone(), combined.is_cached());
    }

    pub fn store(&self) -> Arc<LocalStore> {
        Arc::clone(&self.store)
    }

    fn key_fn(&self, joiner: &str, input: &str) -> Option<&KeyFn> {
        self.input_join_keys
            .get(&(joiner.to_string(), input.to_string()))
            .or_else(|| self.join_keys.get(joiner))
    }
}

impl CollectionBackend for LocalBackend {
    type Records = LocalDataset<Record>;
    type Combined = LocalDataset<RecordInfo>;
    type Errors = LocalDataset<ErrorRecord>;
    type Alerts = LocalDataset<Alert>;
    type Keyed = LocalDataset<(String, Record)>;
    type Joined = LocalDataset<(String, JoinRow)>;

    type Compute = ComputeFn;
    type SinkPlugin = SinkFn;
    type Windower = WindowFn;

    fn source(&self, stage: &StageSpec, stats: &SharedCollector) -> anyhow::Result<Self::Combined> {
        let infos = self
            .sources
            .get(&stage.name)
            .cloned()
            .ok_or_else(|| anyhow!("no records registered for source '{}'", stage.name))?;

        record_counts(stats, 0, &infos);
        Ok(LocalDataset::from_vec(infos))
    }

    fn transform(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined> {
        let out: Vec<RecordInfo> = match self.transforms.get(&stage.name) {
            Some(f) => input.as_slice().par_iter().flat_map_iter(|r| f(r)).collect(),
            None => input.iter().cloned().map(RecordInfo::output).collect(),
        };

        record_counts(stats, input.len(), &out);
        Ok(LocalDataset::from_vec(out))
    }

    fn multi_output_transform(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined> {
        self.transform(stage, input, stats)
    }

    fn error_transform(
        &self,
        stage: &StageSpec,
        errors: &Self::Errors,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined> {
        let out: Vec<RecordInfo> = match self.error_transforms.get(&stage.name) {
            Some(f) => errors.as_slice().par_iter().flat_map_iter(|e| f(e)).collect(),
            None => errors.iter().map(error_as_output).collect(),
        };

        record_counts(stats, errors.len(), &out);
        Ok(LocalDataset::from_vec(out))
    }

    fn aggregate(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        partitions: Option<usize>,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Combined> {
        let aggregation = self
            .aggregations
            .get(&stage.name)
            .ok_or_else(|| anyhow!("no aggregation registered for stage '{}'", stage.name))?;

        let partitions = partitions.unwrap_or(self.default_partitions).max(1);
        self.partitions_used.insert(stage.name.clone(), partitions);
        debug!(stage = %stage.name, partitions, "aggregating");

        let keyed: Vec<(String, &Record)> = input
            .as_slice()
            .par_iter()
            .map(|r| (aggregation.group_key)(r).map(|key| (key, r)))
            .collect::<anyhow::Result<_>>()?;

        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for (key, record) in keyed {
            groups.entry(key).or_default().push(record.clone());
        }

        let out: Vec<RecordInfo> = groups
            .into_par_iter()
            .map(|(key, records)| RecordInfo::output((aggregation.reduce)(&key, &records)))
            .collect();

        record_counts(stats, input.len(), &out);
        Ok(LocalDataset::from_vec(out))
    }

    fn compute(
        &self,
        _stage: &StageSpec,
        input: &Self::Records,
        plugin: Self::Compute,
    ) -> anyhow::Result<Self::Records> {
        Ok(LocalDataset::from_vec(plugin(input.as_slice())?))
    }

    fn window(
        &self,
        _stage: &StageSpec,
        input: &Self::Records,
        windower: Self::Windower,
    ) -> anyhow::Result<Self::Records> {
        Ok(LocalDataset::from_vec(windower(input.as_slice())?))
    }

    fn publish_alerts(
        &self,
        stage: &StageSpec,
        alerts: &Self::Alerts,
        stats: &SharedCollector,
    ) -> anyhow::Result<()> {
        stats.incr_input_records(alerts.len() as u64);
        self.store.publish(&stage.name, alerts.as_slice());
        Ok(())
    }

    fn store_task(&self, stage: &StageSpec, input: &Self::Records, stats: &SharedCollector) -> SinkTask {
        let name = stage.name.clone();
        let records = input.clone();
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(stats);
        let failure = self.sink_failures.get(&stage.name).cloned();

        SinkTask::new(stage.name.clone(), move || {
            if let Some(message) = failure {
                return Err(anyhow::Error::msg(message));
            }
            stats.incr_input_records(records.len() as u64);
            store.write(&name, records.as_slice());
            stats.incr_output_records(records.len() as u64);
            Ok(())
        })
    }

    fn plugin_store_task(
        &self,
        stage: &StageSpec,
        input: &Self::Records,
        plugin: Self::SinkPlugin,
    ) -> SinkTask {
        let records = input.clone();
        SinkTask::new(stage.name.clone(), move || plugin(records.as_slice()))
    }

    fn error_records(&self, stage: &StageSpec, combined: &Self::Combined) -> Self::Errors {
        self.record_split(stage, combined);
        LocalDataset::from_vec(combined.iter().filter_map(RecordInfo::as_error).cloned().collect())
    }

    fn alert_records(&self, stage: &StageSpec, combined: &Self::Combined) -> Self::Alerts {
        self.record_split(stage, combined);
        LocalDataset::from_vec(combined.iter().filter_map(RecordInfo::as_alert).cloned().collect())
    }

    fn output_records(
        &self,
        stage: &StageSpec,
        combined: &Self::Combined,
        port: Option<&str>,
    ) -> Self::Records {
        self.record_split(stage, combined);
        LocalDataset::from_vec(
            combined
                .iter()
                .filter_map(|info| info.output_on(port))
                .cloned()
                .collect(),
        )
    }

    fn add_join_key(
        &self,
        stage: &StageSpec,
        input_stage: &str,
        input: &Self::Records,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Keyed> {
        let key_fn = self.key_fn(&stage.name, input_stage).ok_or_else(|| {
            anyhow!(
                "no join key registered for stage '{}' input '{}'",
                stage.name,
                input_stage
            )
        })?;

        let keyed: Vec<(String, Record)> = input
            .as_slice()
            .par_iter()
            .map(|r| key_fn(r).map(|key| (key, r.clone())))
            .collect::<anyhow::Result<_>>()?;

        stats.incr_input_records(keyed.len() as u64);
        Ok(LocalDataset::from_vec(keyed))
    }

    fn seed_join(&self, keyed: &Self::Keyed, seed: &SeedFn) -> Self::Joined {
        LocalDataset::from_vec(
            keyed
                .iter()
                .map(|(key, record)| (key.clone(), seed(record)))
                .collect(),
        )
    }

    fn join(
        &self,
        left: &Self::Joined,
        right: &Self::Keyed,
        join_type: JoinType,
        partitions: Option<usize>,
        flatten: &FlattenFn,
    ) -> Self::Joined {
        let mut by_key: HashMap<&str, Vec<&Record>> = HashMap::new();
        for (key, record) in right.iter() {
            by_key.entry(key.as_str()).or_default().push(record);
        }

        let partitions = partitions.unwrap_or(self.default_partitions).max(1);
        let chunk_size = left.len().div_ceil(partitions).max(1);

        let mut rows: Vec<(String, JoinRow)> = left
            .as_slice()
            .par_chunks(chunk_size)
            .flat_map_iter(|chunk| join_chunk(chunk, &by_key, join_type, flatten))
            .collect();

        if join_type == JoinType::FullOuter {
            let left_keys: HashSet<&str> = left.iter().map(|(key, _)| key.as_str()).collect();
            rows.extend(
                right
                    .iter()
                    .filter(|(key, _)| !left_keys.contains(key.as_str()))
                    .map(|(key, record)| (key.clone(), flatten(None, Some(record)))),
            );
        }

        LocalDataset::from_vec(rows)
    }

    fn merge_join_results(
        &self,
        _stage: &StageSpec,
        joined: &Self::Joined,
        stats: &SharedCollector,
    ) -> anyhow::Result<Self::Records> {
        let merged: Vec<Record> = joined.iter().map(|(_, row)| merge_row(row)).collect();
        stats.incr_output_records(merged.len() as u64);
        Ok(LocalDataset::from_vec(merged))
    }
}

fn join_chunk(
    chunk: &[(String, JoinRow)],
    by_key: &HashMap<&str, Vec<&Record>>,
    join_type: JoinType,
    flatten: &FlattenFn,
) -> Vec<(String, JoinRow)> {
    let mut out = Vec::new();
    for (key, row) in chunk {
        match by_key.get(key.as_str()) {
            Some(matches) => {
                for record in matches {
                    out.push((key.clone(), flatten(Some(row), Some(*record))));
                }
            }
            None if join_type == JoinType::Inner => {}
            None => out.push((key.clone(), flatten(Some(row), None))),
        }
    }
    out
}

/// `{stage: record}` per element; absent inputs map to null
fn merge_row(row: &JoinRow) -> Record {
    let mut merged = Map::new();
    for element in row {
        let value = element
            .record
            .as_ref()
            .map(|value| value.record().clone())
            .unwrap_or(Record::Null);
        merged.insert(element.stage.clone(), value);
    }
    Record::Object(merged)
}

fn error_as_output(error: &ErrorRecord) -> RecordInfo {
    RecordInfo::output(json!({
        "stage": error.stage,
        "code": error.code,
        "message": error.message,
        "record": error.record,
    }))
}

fn field_key(field: &str) -> KeyFn {
    let field = field.to_string();
    Arc::new(move |record: &Record| match record.get(field.as_str()) {
        Some(Record::String(s)) => Ok(s.clone()),
        Some(value) => Ok(value.to_string()),
        None => Err(anyhow!("record has no field '{}'", field)),
    })
}

fn record_counts(stats: &SharedCollector, input: usize, out: &[RecordInfo]) {
    let errors = out.iter().filter(|info| info.is_error()).count();
    let outputs = out
        .iter()
        .filter(|info| matches!(info, RecordInfo::Output { .. }))
        .count();

    stats.incr_input_records(input as u64);
    stats.incr_output_records(outputs as u64);
    stats.incr_error_records(errors as u64);
}
