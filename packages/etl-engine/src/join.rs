//! Join planner
//!
//! Builds a multi-way join over keyed input streams:
//! 1. Required inputs are inner-joined in their declared order
//! 2. Remaining inputs are outer-joined in lexicographic order:
//!    left outer when there were required inputs, full outer otherwise
//!
//! Every joined row carries one `JoinElement` per input joined so far; inputs
//! with no match for a key appear as an absent marker.

use crate::backend::{Channel, CollectionBackend, FlattenFn, JoinType, SeedFn};
use crate::error::{PipelineError, Result};
use crate::records::{JoinElement, JoinRow, Record};
use crate::stage::StageSpec;
use crate::stats::SharedCollector;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Join configuration of a joiner stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinConfig {
    /// Inner-joined in this order
    pub required: Vec<String>,
    /// Outer-joined. Connected inputs not listed as required are optional as well.
    pub optional: BTreeSet<String>,
    /// Explicit partition count for every join step
    pub partitions: Option<usize>,
}

impl JoinConfig {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_optional(mut self, input: impl Into<String>) -> Self {
        self.optional.insert(input.into());
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = Some(partitions);
        self
    }
}

/// How one input enters the join tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStepKind {
    /// First input: its records become single-element rows
    Seed,
    Inner,
    LeftOuter,
    FullOuter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub input: String,
    pub kind: JoinStepKind,
}

/// Ordered join steps for one joiner stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    stage: String,
    steps: Vec<JoinStep>,
    partitions: Option<usize>,
    full_outer: bool,
}

impl JoinPlan {
    /// Plan the join of `inputs` (the stage's connected inputs) under `config`
    pub fn new<'a, I>(stage: &str, config: &JoinConfig, inputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let inputs: BTreeSet<&str> = inputs.into_iter().collect();

        for name in config.required.iter().chain(config.optional.iter()) {
            if !inputs.contains(name.as_str()) {
                return Err(PipelineError::JoinInputMissing {
                    stage: stage.to_string(),
                    input: name.clone(),
                });
            }
        }

        let mut steps = Vec::with_capacity(inputs.len());
        let mut planned: BTreeSet<&str> = BTreeSet::new();

        for name in &config.required {
            if !planned.insert(name.as_str()) {
                continue;
            }
            let kind = if steps.is_empty() {
                JoinStepKind::Seed
            } else {
                JoinStepKind::Inner
            };
            steps.push(JoinStep {
                input: name.clone(),
                kind,
            });
        }

        let is_full_outer = steps.is_empty();

        for name in inputs.iter().filter(|n| !planned.contains(*n)) {
            let kind = if steps.is_empty() {
                JoinStepKind::Seed
            } else if is_full_outer {
                JoinStepKind::FullOuter
            } else {
                JoinStepKind::LeftOuter
            };
            steps.push(JoinStep {
                input: name.to_string(),
                kind,
            });
        }

        if steps.is_empty() {
            return Err(PipelineError::NoJoinInputs(stage.to_string()));
        }

        Ok(Self {
            stage: stage.to_string(),
            steps,
            partitions: config.partitions,
            full_outer: is_full_outer,
        })
    }

    pub fn steps(&self) -> &[JoinStep] {
        &self.steps
    }

    pub fn partitions(&self) -> Option<usize> {
        self.partitions
    }

    /// True when no input is required, so absence is allowed on every side
    pub fn is_full_outer(&self) -> bool {
        self.full_outer
    }

    /// Run the plan over the keyed inputs and return key → joined rows
    pub fn execute<B: CollectionBackend + ?Sized>(
        &self,
        backend: &B,
        keyed: &HashMap<String, B::Keyed>,
    ) -> Result<B::Joined> {
        let mut joined: Option<B::Joined> = None;
        let mut joined_inputs: Vec<String> = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let stream = keyed
                .get(&step.input)
                .ok_or_else(|| PipelineError::JoinInputMissing {
                    stage: self.stage.clone(),
                    input: step.input.clone(),
                })?;

            debug!(
                stage = %self.stage,
                input = %step.input,
                kind = ?step.kind,
                "join step"
            );

            joined = Some(match (&joined, step.kind) {
                (None, _) | (Some(_), JoinStepKind::Seed) => {
                    backend.seed_join(stream, &seed(&step.input))
                }
                (Some(acc), JoinStepKind::Inner) => backend.join(
                    acc,
                    stream,
                    JoinType::Inner,
                    self.partitions,
                    &flatten_inner(&step.input),
                ),
                (Some(acc), JoinStepKind::LeftOuter) => backend.join(
                    acc,
                    stream,
                    JoinType::LeftOuter,
                    self.partitions,
                    &flatten_left_outer(&step.input),
                ),
                (Some(acc), JoinStepKind::FullOuter) => backend.join(
                    acc,
                    stream,
                    JoinType::FullOuter,
                    self.partitions,
                    &flatten_full_outer(&step.input, joined_inputs.clone()),
                ),
            });
            joined_inputs.push(step.input.clone());
        }

        joined.ok_or_else(|| PipelineError::NoJoinInputs(self.stage.clone()))
    }
}

/// Plan, execute and merge the join of `keyed` for `stage`.
///
/// The merged output is always cached, independent of the cache policy.
pub fn join_inputs<B: CollectionBackend + ?Sized>(
    backend: &B,
    stage: &StageSpec,
    config: &JoinConfig,
    keyed: &HashMap<String, B::Keyed>,
    stats: &SharedCollector,
) -> Result<B::Records> {
    let plan = JoinPlan::new(&stage.name, config, keyed.keys().map(String::as_str))?;
    let joined = plan.execute(backend, keyed)?;
    let merged = backend
        .merge_join_results(stage, &joined, stats)
        .map_err(|e| PipelineError::collaborator(&stage.name, e))?;
    Ok(merged.cache())
}

pub fn seed(input: &str) -> SeedFn {
    let input = input.to_string();
    Arc::new(move |record: &Record| vec![JoinElement::present(input.clone(), record)])
}

/// Both sides always present: concatenate
pub fn flatten_inner(input: &str) -> FlattenFn {
    let input = input.to_string();
    Arc::new(move |left: Option<&JoinRow>, right: Option<&Record>| {
        let mut row = left.cloned().unwrap_or_default();
        row.push(element(&input, right));
        row
    })
}

/// Left side always present; right side may be absent
pub fn flatten_left_outer(input: &str) -> FlattenFn {
    flatten_inner(input)
}

/// Either side may be absent. An absent left side becomes one marker per input joined before.
pub fn flatten_full_outer(input: &str, previous: Vec<String>) -> FlattenFn {
    let input = input.to_string();
    Arc::new(move |left: Option<&JoinRow>, right: Option<&Record>| {
        let mut row = match left {
            Some(row) => row.clone(),
            None => previous.iter().map(JoinElement::absent).collect(),
        };
        row.push(element(&input, right));
        row
    })
}

fn element(input: &str, record: Option<&Record>) -> JoinElement {
    match record {
        Some(record) => JoinElement::present(input, record),
        None => JoinElement::absent(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(plan: &JoinPlan) -> Vec<(&str, JoinStepKind)> {
        plan.steps()
            .iter()
            .map(|s| (s.input.as_str(), s.kind))
            .collect()
    }

    #[test]
    fn test_plan_required_then_optional() {
        let config = JoinConfig::new(["b", "a"]);
        let plan = JoinPlan::new("j", &config, ["a", "b", "d", "c"]).unwrap();

        assert_eq!(
            kinds(&plan),
            vec![
                ("b", JoinStepKind::Seed),
                ("a", JoinStepKind::Inner),
                ("c", JoinStepKind::LeftOuter),
                ("d", JoinStepKind::LeftOuter),
            ]
        );
        assert!(!plan.is_full_outer());
    }

    #[test]
    fn test_plan_no_required_is_full_outer() {
        let config = JoinConfig::default();
        let plan = JoinPlan::new("j", &config, ["y", "x", "z"]).unwrap();

        assert_eq!(
            kinds(&plan),
            vec![
                ("x", JoinStepKind::Seed),
                ("y", JoinStepKind::FullOuter),
                ("z", JoinStepKind::FullOuter),
            ]
        );
        assert!(plan.is_full_outer());
    }

    #[test]
    fn test_plan_zero_inputs_fails() {
        let result = JoinPlan::new("j", &JoinConfig::default(), std::iter::empty());
        assert!(matches!(result, Err(PipelineError::NoJoinInputs(ref s)) if s == "j"));
    }

    #[test]
    fn test_plan_unknown_required_input_fails() {
        let config = JoinConfig::new(["ghost"]);
        let result = JoinPlan::new("j", &config, ["a"]);
        assert!(matches!(
            result,
            Err(PipelineError::JoinInputMissing { ref input, .. }) if input == "ghost"
        ));
    }

    #[test]
    fn test_plan_keeps_partitions() {
        let config = JoinConfig::new(["a"]).with_partitions(8);
        let plan = JoinPlan::new("j", &config, ["a", "b"]).unwrap();
        assert_eq!(plan.partitions(), Some(8));
    }

    #[test]
    fn test_flatten_left_outer_marks_absent() {
        let left = vec![JoinElement::present("x", &json!(1))];
        let row = flatten_left_outer("y")(Some(&left), None);

        assert_eq!(row.len(), 2);
        assert_eq!(row[0].stage, "x");
        assert!(row[1].is_absent());
        assert_eq!(row[1].stage, "y");
    }

    #[test]
    fn test_flatten_full_outer_absent_left() {
        let flatten = flatten_full_outer("z", vec!["x".to_string(), "y".to_string()]);
        let row = flatten(None, Some(&json!({"k": 1})));

        assert_eq!(
            row,
            vec![
                JoinElement::absent("x"),
                JoinElement::absent("y"),
                JoinElement::present("z", &json!({"k": 1})),
            ]
        );
    }
}
