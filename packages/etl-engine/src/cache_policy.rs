//! Decides whether a stage's result must be materialized.
//!
//! A pure function of DAG shape. Joiner outputs are cached by the join path
//! regardless of this decision.

use crate::dag::Dag;

/// Why a stage's output is cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReason {
    /// Read by more than one downstream stage
    Fanout(usize),
    /// Feeds a consumer that unions several inputs
    FeedsUnion(String),
}

impl std::fmt::Display for CacheReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheReason::Fanout(n) => write!(f, "read by {} stages", n),
            CacheReason::FeedsUnion(consumer) => write!(f, "feeds multi-input stage '{}'", consumer),
        }
    }
}

pub fn cache_reason(dag: &Dag, stage: &str) -> Option<CacheReason> {
    let outputs = dag.outputs(stage);
    if outputs.len() > 1 {
        return Some(CacheReason::Fanout(outputs.len()));
    }

    outputs
        .into_iter()
        .find(|consumer| dag.in_degree(consumer) > 1)
        .map(|consumer| CacheReason::FeedsUnion(consumer.to_string()))
}

/// True iff out-degree(stage) > 1, or some consumer of `stage` has in-degree > 1
pub fn should_cache(dag: &Dag, stage: &str) -> bool {
    cache_reason(dag, stage).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(stages: &[&str], edges: &[(&str, &str)]) -> Dag {
        Dag::new(
            stages.iter().copied(),
            edges.iter().map(|(a, b)| (a.to_string(), b.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_fanout_is_cached() {
        let dag = dag(&["src", "a", "b", "c"], &[("src", "a"), ("a", "b"), ("a", "c")]);

        assert!(should_cache(&dag, "a"));
        assert_eq!(cache_reason(&dag, "a"), Some(CacheReason::Fanout(2)));
        assert!(!should_cache(&dag, "src"));
        assert!(!should_cache(&dag, "b"));
    }

    #[test]
    fn test_feeding_union_is_cached() {
        let dag = dag(&["x", "y", "u"], &[("x", "u"), ("y", "u")]);

        assert_eq!(
            cache_reason(&dag, "x"),
            Some(CacheReason::FeedsUnion("u".to_string()))
        );
        assert!(should_cache(&dag, "y"));
        assert!(!should_cache(&dag, "u"));
    }

    #[test]
    fn test_linear_chain_not_cached() {
        let dag = dag(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);

        for stage in ["a", "b", "c"] {
            assert!(!should_cache(&dag, stage));
        }
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(CacheReason::Fanout(3).to_string(), "read by 3 stages");
        assert!(CacheReason::FeedsUnion("j".to_string())
            .to_string()
            .contains("'j'"));
    }
}
