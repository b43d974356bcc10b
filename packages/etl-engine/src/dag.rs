//! Stage graph model
//!
//! `Dag` is the connection graph of one pipeline phase backed by Petgraph:
//! - Topological order computed once at build time (cycle detection included)
//! - Input / output sets per stage, sorted by name
//! - Source (in-degree 0) and sink (out-degree 0) membership
//!
//! `PipelinePhase` pairs the DAG with the stage specifications. Nodes without a
//! specification belong to another phase (for example an action) and are
//! skipped by the scheduler.

use crate::error::{PipelineError, Result};
use crate::stage::{StageKind, StageSpec};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Connection graph between stages (A → B means B reads A's output)
#[derive(Debug, Clone)]
pub struct Dag {
    graph: DiGraph<String, ()>,

    /// Stage name → node index for O(1) lookups
    nodes: HashMap<String, NodeIndex>,

    /// Cached topological order
    topological_order: Vec<String>,
}

impl Dag {
    /// Build a DAG from stage names and connections.
    ///
    /// Connection endpoints that are not listed in `stages` are added as nodes.
    /// Duplicate connections collapse into one edge.
    pub fn new<S, C>(stages: S, connections: C) -> Result<Self>
    where
        S: IntoIterator,
        S::Item: Into<String>,
        C: IntoIterator<Item = (String, String)>,
    {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        let mut node_for = |graph: &mut DiGraph<String, ()>, name: String| -> NodeIndex {
            *nodes
                .entry(name.clone())
                .or_insert_with(|| graph.add_node(name))
        };

        for stage in stages {
            node_for(&mut graph, stage.into());
        }

        for (from, to) in connections {
            let from_idx = node_for(&mut graph, from);
            let to_idx = node_for(&mut graph, to);
            graph.update_edge(from_idx, to_idx, ());
        }

        let topological_order = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|idx| graph[idx].clone()).collect(),
            Err(cycle) => return Err(PipelineError::DagCycle(graph[cycle.node_id()].clone())),
        };

        Ok(Self {
            graph,
            nodes,
            topological_order,
        })
    }

    /// Stages in execution order. Every stage appears after all of its inputs.
    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.nodes.contains_key(stage)
    }

    /// Stages whose output `stage` reads
    pub fn inputs(&self, stage: &str) -> BTreeSet<&str> {
        self.neighbors(stage, Direction::Incoming)
    }

    /// Stages that read `stage`'s output
    pub fn outputs(&self, stage: &str) -> BTreeSet<&str> {
        self.neighbors(stage, Direction::Outgoing)
    }

    pub fn in_degree(&self, stage: &str) -> usize {
        self.inputs(stage).len()
    }

    pub fn out_degree(&self, stage: &str) -> usize {
        self.outputs(stage).len()
    }

    pub fn sources(&self) -> BTreeSet<&str> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].as_str())
            .collect()
    }

    pub fn sinks(&self) -> BTreeSet<&str> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].as_str())
            .collect()
    }

    pub fn stage_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn connection_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn neighbors(&self, stage: &str, direction: Direction) -> BTreeSet<&str> {
        let Some(&idx) = self.nodes.get(stage) else {
            return BTreeSet::new();
        };

        self.graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].as_str())
            .collect()
    }
}

/// Serializable phase description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSpec {
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// The stages scheduled together in one run, plus their DAG
#[derive(Debug, Clone)]
pub struct PipelinePhase {
    stages: BTreeMap<String, StageSpec>,
    dag: Option<Dag>,
}

impl PipelinePhase {
    pub fn new(stages: Vec<StageSpec>, dag: Option<Dag>) -> Result<Self> {
        let mut stage_map = BTreeMap::new();
        for stage in stages {
            let name = stage.name.clone();
            if stage_map.insert(name.clone(), stage).is_some() {
                return Err(PipelineError::config(format!(
                    "Duplicate stage name '{}'",
                    name
                )));
            }
        }

        let phase = Self {
            stages: stage_map,
            dag,
        };
        phase.check_port_consumers()?;
        Ok(phase)
    }

    /// A stage with named ports publishes no main output, so every consumer
    /// reading its records must have a port. Error transforms and alert
    /// publishers read side channels and need none.
    fn check_port_consumers(&self) -> Result<()> {
        for producer in self.stages.values() {
            if producer.output_ports.is_empty() {
                continue;
            }
            for consumer in self.stage_outputs(&producer.name) {
                let Some(spec) = self.stage(consumer) else {
                    continue;
                };
                let reads_main = match spec.kind {
                    StageKind::ErrorTransform | StageKind::AlertPublisher => false,
                    StageKind::Connector => true,
                    _ => producer.kind == StageKind::Connector || producer.port_for(consumer).is_none(),
                };
                if reads_main {
                    return Err(PipelineError::config(format!(
                        "Stage '{}' routes to named ports but consumer '{}' reads main output",
                        producer.name, consumer
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn builder() -> PhaseBuilder {
        PhaseBuilder::default()
    }

    pub fn from_spec(spec: PhaseSpec) -> Result<Self> {
        let mut builder = Self::builder();
        for stage in spec.stages {
            builder = builder.stage(stage);
        }
        for connection in spec.connections {
            builder = builder.connect(connection.from, connection.to);
        }
        builder.build()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_spec(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_spec(serde_json::from_str(json)?)
    }

    pub fn dag(&self) -> Option<&Dag> {
        self.dag.as_ref()
    }

    /// The DAG, or `MissingDag` when the phase has none
    pub fn require_dag(&self) -> Result<&Dag> {
        self.dag.as_ref().ok_or(PipelineError::MissingDag)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.values()
    }

    pub fn stage_inputs(&self, name: &str) -> BTreeSet<&str> {
        self.dag.as_ref().map(|d| d.inputs(name)).unwrap_or_default()
    }

    pub fn stage_outputs(&self, name: &str) -> BTreeSet<&str> {
        self.dag.as_ref().map(|d| d.outputs(name)).unwrap_or_default()
    }

    pub fn is_source(&self, name: &str) -> bool {
        self.dag
            .as_ref()
            .is_some_and(|d| d.contains(name) && d.in_degree(name) == 0)
    }

    pub fn is_sink(&self, name: &str) -> bool {
        self.dag
            .as_ref()
            .is_some_and(|d| d.contains(name) && d.out_degree(name) == 0)
    }

    /// Execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        let Some(dag) = &self.dag else {
            return "<no connections>".to_string();
        };

        dag.topological_order()
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let kind = self
                    .stage(name)
                    .map(|s| s.kind.as_str())
                    .unwrap_or("external");
                let inputs: Vec<_> = dag.inputs(name).into_iter().collect();
                if inputs.is_empty() {
                    format!("{}: {} ({})", i + 1, name, kind)
                } else {
                    format!("{}: {} ({}) <- {}", i + 1, name, kind, inputs.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Builder for [`PipelinePhase`]
#[derive(Debug, Default)]
pub struct PhaseBuilder {
    stages: Vec<StageSpec>,
    connections: Vec<(String, String)>,
}

impl PhaseBuilder {
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn connect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.connections.push((from.into(), to.into()));
        self
    }

    pub fn build(self) -> Result<PipelinePhase> {
        let dag = Dag::new(
            self.stages.iter().map(|s| s.name.clone()),
            self.connections,
        )?;
        PipelinePhase::new(self.stages, Some(dag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|s| s == name).unwrap()
    }

    #[test]
    fn test_dag_topological_order() {
        let dag = Dag::new(
            ["src", "a", "b", "c", "sink"],
            edges(&[
                ("src", "a"),
                ("a", "b"),
                ("a", "c"),
                ("b", "sink"),
                ("c", "sink"),
            ]),
        )
        .unwrap();

        let order = dag.topological_order();
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], "src");
        assert!(position(order, "a") < position(order, "b"));
        assert!(position(order, "a") < position(order, "c"));
        assert!(position(order, "b") < position(order, "sink"));
        assert!(position(order, "c") < position(order, "sink"));
    }

    #[test]
    fn test_dag_cycle_detection() {
        let result = Dag::new(["a", "b"], edges(&[("a", "b"), ("b", "a")]));
        assert!(matches!(result, Err(PipelineError::DagCycle(_))));
    }

    #[test]
    fn test_dag_duplicate_connections_collapse() {
        let dag = Dag::new(["a", "b"], edges(&[("a", "b"), ("a", "b")])).unwrap();
        assert_eq!(dag.connection_count(), 1);
        assert_eq!(dag.out_degree("a"), 1);
    }

    #[test]
    fn test_dag_sources_and_sinks() {
        let dag = Dag::new(
            ["x", "y", "j", "out"],
            edges(&[("x", "j"), ("y", "j"), ("j", "out")]),
        )
        .unwrap();

        assert_eq!(dag.sources().into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(dag.sinks().into_iter().collect::<Vec<_>>(), vec!["out"]);
        assert_eq!(dag.inputs("j").into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(dag.in_degree("j"), 2);
        assert!(dag.inputs("missing").is_empty());
    }

    #[test]
    fn test_phase_duplicate_stage_rejected() {
        let result = PipelinePhase::new(
            vec![
                StageSpec::new("a", StageKind::Transform),
                StageSpec::new("a", StageKind::Sink),
            ],
            None,
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_phase_without_dag() {
        let phase =
            PipelinePhase::new(vec![StageSpec::new("a", StageKind::BatchSource)], None).unwrap();
        assert!(matches!(phase.require_dag(), Err(PipelineError::MissingDag)));
        assert!(phase.stage_inputs("a").is_empty());
        assert!(!phase.is_source("a"));
    }

    #[test]
    fn test_phase_from_yaml() {
        let yaml = r#"
stages:
  - name: src
    kind: batch-source
  - name: split
    kind: splitter-transform
    output_ports:
      good: { port: valid }
      bad: { port: invalid }
  - name: good
    kind: sink
  - name: bad
    kind: sink
connections:
  - { from: src, to: split }
  - { from: split, to: good }
  - { from: split, to: bad }
"#;

        let phase = PipelinePhase::from_yaml_str(yaml).unwrap();
        let split = phase.stage("split").unwrap();
        assert_eq!(split.kind, StageKind::SplitterTransform);
        assert_eq!(split.port_for("bad"), Some("invalid"));
        assert!(phase.is_source("src"));
        assert!(phase.is_sink("good"));
        assert!(phase.execution_plan().contains("split (splitter-transform) <- src"));
    }

    #[test]
    fn test_phase_external_input_node() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("t", StageKind::Transform))
            .connect("upstream_action", "t")
            .build()
            .unwrap();

        assert!(phase.stage("upstream_action").is_none());
        assert_eq!(
            phase.stage_inputs("t").into_iter().collect::<Vec<_>>(),
            vec!["upstream_action"]
        );
        assert!(phase.execution_plan().contains("upstream_action (external)"));
    }

    #[test]
    fn test_phase_rejects_main_consumer_of_port_routed_stage() {
        let result = PipelinePhase::builder()
            .stage(StageSpec::new("src", StageKind::BatchSource))
            .stage(StageSpec::new("t", StageKind::Transform).with_port("a", "p1"))
            .stage(StageSpec::new("a", StageKind::Sink))
            .stage(StageSpec::new("b", StageKind::Sink))
            .connect("src", "t")
            .connect("t", "a")
            .connect("t", "b")
            .build();

        match result {
            Err(PipelineError::Config(msg)) => {
                assert!(msg.contains("consumer 'b' reads main output"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_phase_port_routed_stage_with_error_consumer() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("t", StageKind::Transform).with_port("a", "p1"))
            .stage(StageSpec::new("a", StageKind::Sink))
            .stage(StageSpec::new("errs", StageKind::ErrorTransform))
            .connect("t", "a")
            .connect("t", "errs")
            .build()
            .unwrap();

        assert_eq!(phase.stage("t").unwrap().port_for("a"), Some("p1"));
    }
}
