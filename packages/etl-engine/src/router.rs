//! Record channel router
//!
//! Splits a stage's combined output into the channels downstream stages read:
//! main output or one channel per named port, plus error and alert channels
//! when an error transform / alert publisher consumes the stage.

use crate::backend::{Channel, CollectionBackend};
use crate::cache_policy::cache_reason;
use crate::dag::PipelinePhase;
use crate::emitted::{EmittedRecords, StageOutput};
use crate::stage::{StageKind, StageSpec};
use std::collections::BTreeMap;
use tracing::debug;

/// Which side channels downstream stages consume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputTaps {
    pub errors: bool,
    pub alerts: bool,
}

impl OutputTaps {
    /// Scan the stage's consumers for error transforms and alert publishers
    pub fn for_stage(phase: &PipelinePhase, stage: &str) -> Self {
        let mut taps = OutputTaps::default();
        for consumer in phase.stage_outputs(stage) {
            match phase.stage(consumer).map(|s| s.kind) {
                Some(StageKind::ErrorTransform) => taps.errors = true,
                Some(StageKind::AlertPublisher) => taps.alerts = true,
                _ => {}
            }
        }
        taps
    }
}

/// Publish `combined` into the stage's channels.
///
/// The combined stream is cached once when more than one reader splits it
/// (error tap, alert tap, several ports). Each derived channel is cached again
/// when the cache policy asks for the stage's output to be cached.
pub fn route<B: CollectionBackend + ?Sized>(
    backend: &B,
    phase: &PipelinePhase,
    stage: &StageSpec,
    combined: B::Combined,
    taps: OutputTaps,
) -> EmittedRecords<B> {
    let ports = stage.port_names();

    let combined = if taps.errors || taps.alerts || ports.len() > 1 {
        debug!(stage = %stage.name, "caching combined output before split");
        combined.cache()
    } else {
        combined
    };

    let reason = phase.dag().and_then(|dag| cache_reason(dag, &stage.name));
    if let Some(reason) = &reason {
        debug!(stage = %stage.name, %reason, "caching stage output channels");
    }
    let cache = reason.is_some();

    let errors = taps
        .errors
        .then(|| cache_if(backend.error_records(stage, &combined), cache));
    let alerts = taps
        .alerts
        .then(|| cache_if(backend.alert_records(stage, &combined), cache));

    let output = if ports.is_empty() {
        StageOutput::Main(cache_if(
            backend.output_records(stage, &combined, None),
            cache,
        ))
    } else {
        let by_port: BTreeMap<String, B::Records> = ports
            .into_iter()
            .map(|port| {
                let channel = backend.output_records(stage, &combined, Some(port));
                (port.to_string(), cache_if(channel, cache))
            })
            .collect();
        StageOutput::Ports(by_port)
    };

    EmittedRecords {
        output,
        errors,
        alerts,
    }
}

fn cache_if<C: Channel>(channel: C, cache: bool) -> C {
    if cache {
        channel.cache()
    } else {
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalBackend, LocalDataset};
    use crate::records::{ErrorRecord, RecordInfo};
    use serde_json::json;

    fn combined() -> LocalDataset<RecordInfo> {
        LocalDataset::from_vec(vec![
            RecordInfo::port_output("p1", json!({"id": 1})),
            RecordInfo::port_output("p2", json!({"id": 2})),
            RecordInfo::Error(ErrorRecord {
                record: json!({"id": 3}),
                code: 7,
                message: "bad".to_string(),
                stage: "split".to_string(),
            }),
        ])
    }

    #[test]
    fn test_taps_detected_from_consumers() {
        let phase = PipelinePhase::builder()
            .stage(StageSpec::new("t", StageKind::Transform))
            .stage(StageSpec::new("errs", StageKind::ErrorTransform))
            .stage(StageSpec::new("out", StageKind::Sink))
            .connect("t", "errs")
            .connect("t", "out")
            .build()
            .unwrap();

        assert_eq!(
            OutputTaps::for_stage(&phase, "t"),
            OutputTaps {
                errors: true,
                alerts: false
            }
        );
        assert_eq!(OutputTaps::for_stage(&phase, "out"), OutputTaps::default());
    }

    #[test]
    fn test_ports_without_taps() {
        let split = StageSpec::new("split", StageKind::SplitterTransform)
            .with_port("a", "p1")
            .with_port("b", "p2");
        let phase = PipelinePhase::builder()
            .stage(split.clone())
            .stage(StageSpec::new("a", StageKind::Sink))
            .stage(StageSpec::new("b", StageKind::Sink))
            .connect("split", "a")
            .connect("split", "b")
            .build()
            .unwrap();

        let backend = LocalBackend::new();
        let emitted = route(&backend, &phase, &split, combined(), OutputTaps::default());

        assert!(emitted.output.main().is_none());
        let ports = emitted.output.ports().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports["p1"].to_vec(), vec![json!({"id": 1})]);
        assert_eq!(ports["p2"].to_vec(), vec![json!({"id": 2})]);
        // two consumers: derived channels cached
        assert!(ports["p1"].is_cached());
        assert!(emitted.errors.is_none());
        assert!(emitted.alerts.is_none());
    }

    #[test]
    fn test_error_tap_on_single_output() {
        let t = StageSpec::new("t", StageKind::Transform);
        let phase = PipelinePhase::builder()
            .stage(t.clone())
            .stage(StageSpec::new("errs", StageKind::ErrorTransform))
            .connect("t", "errs")
            .build()
            .unwrap();

        let backend = LocalBackend::new();
        let taps = OutputTaps::for_stage(&phase, "t");
        let emitted = route(&backend, &phase, &t, combined(), taps);

        assert_eq!(backend.split_from_cache("t"), Some(true));
        let errors = emitted.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.to_vec()[0].code, 7);
        // single consumer, single input consumer: no policy cache
        assert!(!errors.is_cached());
        let main = emitted.output.main().unwrap();
        assert_eq!(main.len(), 2);
    }

    #[test]
    fn test_combined_cached_before_split_only_with_several_readers() {
        let t = StageSpec::new("t", StageKind::Transform);
        let tapped = PipelinePhase::builder()
            .stage(t.clone())
            .stage(StageSpec::new("out", StageKind::Sink))
            .stage(StageSpec::new("alerts", StageKind::AlertPublisher))
            .connect("t", "out")
            .connect("t", "alerts")
            .build()
            .unwrap();
        let plain = PipelinePhase::builder()
            .stage(t.clone())
            .stage(StageSpec::new("out", StageKind::Sink))
            .connect("t", "out")
            .build()
            .unwrap();

        let backend = LocalBackend::new();
        let taps = OutputTaps::for_stage(&tapped, "t");
        assert!(taps.alerts);
        let emitted = route(&backend, &tapped, &t, combined(), taps);
        assert_eq!(backend.split_from_cache("t"), Some(true));
        assert!(emitted.alerts.is_some());

        let backend = LocalBackend::new();
        route(&backend, &plain, &t, combined(), OutputTaps::for_stage(&plain, "t"));
        assert_eq!(backend.split_from_cache("t"), Some(false));
    }
}
