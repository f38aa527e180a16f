//! End-to-end registry scenarios against the recording host.
//!
//! Each test scripts registrations and delivered batches, then checks the
//! callbacks that fired and the host interactions the registry made.

use pretty_assertions::assert_eq;
use sightline_core::{
    ContextKey, ContextRetention, EvidenceSinkConfig, HostError, ObserveOptions, RegistryConfig,
    RegistryError, Threshold, VisibilityRegistry,
};
use sightline_harness::{
    CallbackLog, ElementId, FrameId, HostEvent, RecordingHost, entry, init_test_tracing,
    recording_registry,
};

const A: ElementId = ElementId(1);
const B: ElementId = ElementId(2);
const C: ElementId = ElementId(3);

#[test]
fn contains_after_add() {
    init_test_tracing();
    let (mut registry, _probe) = recording_registry();
    assert!(!registry.contains(&A));
    registry.add_element(A, |_| {}).unwrap();
    assert!(registry.contains(&A));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.visibility(&A), Some(false));
}

#[test]
fn show_repeat_hide_scenario() {
    init_test_tracing();
    let (mut registry, _probe) = recording_registry();
    let log = CallbackLog::new();
    registry.add_element(A, log.callback(A)).unwrap();

    let report = registry.on_batch_delivered([entry(A, true)]);
    assert_eq!(report.notified, 1);
    assert_eq!(log.calls(), vec![(A, true)]);

    let report = registry.on_batch_delivered([entry(A, true)]);
    assert_eq!(report.notified, 0);
    assert_eq!(log.len(), 1);

    registry.on_batch_delivered([entry(A, false)]);
    assert_eq!(log.calls(), vec![(A, true), (A, false)]);
}

#[test]
fn duplicate_registration_keeps_first_binding() {
    init_test_tracing();
    let (mut registry, probe) = recording_registry();
    let log = CallbackLog::new();
    registry
        .add_element(A, log.callback(A))
        .unwrap()
        .add_element(A, |_| panic!("second binding must be ignored"))
        .unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(probe.watch_calls(), 1);

    let report = registry.on_batch_delivered([entry(A, true)]);
    assert!(report.is_clean());
    assert_eq!(log.calls(), vec![(A, true)]);
}

#[test]
fn strict_register_rejects_duplicates() {
    let (mut registry, probe) = recording_registry();
    registry.register(A, |_| {}, ObserveOptions::new()).unwrap();
    let err = registry
        .register(A, |_| {}, ObserveOptions::new())
        .unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    assert_eq!(probe.watch_calls(), 1);
}

#[test]
fn replace_swaps_callback_and_context() {
    let (mut registry, probe) = recording_registry();
    let log = CallbackLog::new();
    registry.add_element(A, |_| panic!("replaced")).unwrap();
    registry
        .replace_element(A, log.callback(A), ObserveOptions::new().with_margin("10px"))
        .unwrap();

    assert_eq!(registry.context_count(), 1);
    assert_eq!(probe.created_count(), 2);
    assert_eq!(
        registry.registrant(&A).map(|r| r.key().margin.as_str().to_string()),
        Some("10px".to_string())
    );

    registry.on_batch_delivered([entry(A, true)]);
    assert_eq!(log.calls(), vec![(A, true)]);
}

#[test]
fn distinct_frames_get_distinct_contexts() {
    let (mut registry, probe) = recording_registry();
    let left = FrameId::fresh();
    let right = FrameId::fresh();
    registry
        .add_element_with(A, |_| {}, ObserveOptions::new().with_frame(left))
        .unwrap()
        .add_element_with(B, |_| {}, ObserveOptions::new().with_frame(right))
        .unwrap()
        .add_element_with(C, |_| {}, ObserveOptions::new().with_frame(left))
        .unwrap();

    assert_eq!(registry.context_count(), 2);
    assert_eq!(probe.created_count(), 2);
    let left_key = ContextKey {
        frame: Some(left),
        ..ContextKey::default()
    };
    assert_eq!(registry.context_watch_count(&left_key), Some(2));
}

#[test]
fn default_filled_options_share_one_context() {
    let (mut registry, probe) = recording_registry();
    registry
        .add_element(A, |_| {})
        .unwrap()
        .add_element_with(B, |_| {}, ObserveOptions::new())
        .unwrap()
        .add_element_with(
            C,
            |_| {},
            ObserveOptions::new().with_margin("0px").with_threshold(0.0),
        )
        .unwrap();

    assert_eq!(probe.created_count(), 1);
    assert_eq!(registry.context_watch_count(&ContextKey::default()), Some(3));
}

#[test]
fn sequence_thresholds_compare_structurally() {
    let (mut registry, probe) = recording_registry();
    registry
        .add_element_with(A, |_| {}, ObserveOptions::new().with_threshold(vec![0.0, 0.5]))
        .unwrap()
        .add_element_with(B, |_| {}, ObserveOptions::new().with_threshold(vec![0.0, 0.5]))
        .unwrap();
    assert_eq!(probe.created_count(), 1);

    // A scalar and a one-element sequence are different configurations.
    registry
        .add_element_with(C, |_| {}, ObserveOptions::new().with_threshold(0.5))
        .unwrap();
    registry
        .add_element_with(
            ElementId(4),
            |_| {},
            ObserveOptions::new().with_threshold(Threshold::Steps(vec![0.5])),
        )
        .unwrap();
    assert_eq!(probe.created_count(), 3);
}

#[test]
fn one_shot_fires_once_then_leaves() {
    let (mut registry, probe) = recording_registry();
    let log = CallbackLog::new();
    registry
        .add_element_with(A, log.callback(A), ObserveOptions::new().once())
        .unwrap();

    let report = registry.on_batch_delivered([entry(A, true)]);
    assert_eq!(report.released, 1);
    assert!(!registry.contains(&A));
    assert!(probe.watched().is_empty());

    registry.on_batch_delivered([entry(A, false)]);
    registry.on_batch_delivered([entry(A, true)]);
    assert_eq!(log.calls(), vec![(A, true)]);
}

#[test]
fn removing_unknown_element_is_a_noop() {
    let (mut registry, probe) = recording_registry();
    registry.add_element(A, |_| {}).unwrap();
    assert!(!registry.remove_element(&B));
    assert_eq!(registry.len(), 1);
    assert_eq!(probe.watched(), vec![A]);
}

#[test]
fn sequence_registration_is_independent() {
    let (mut registry, probe) = recording_registry();
    let log = CallbackLog::new();
    let shared = log.callback(ElementId(0));
    registry
        .add_elements([A, B, C], shared, ObserveOptions::new())
        .unwrap();

    assert_eq!(registry.elements().copied().collect::<Vec<_>>(), vec![A, B, C]);
    assert_eq!(probe.watch_calls(), 3);

    assert!(registry.remove_element(&B));
    assert_eq!(registry.elements().copied().collect::<Vec<_>>(), vec![A, C]);
    assert_eq!(probe.watched(), vec![A, C]);

    registry.on_batch_delivered([entry(A, true), entry(C, true)]);
    assert_eq!(log.len(), 2);
}

#[test]
fn entries_for_unknown_elements_are_ignored() {
    let (mut registry, _probe) = recording_registry();
    let log = CallbackLog::new();
    registry.add_element(A, log.callback(A)).unwrap();

    let report = registry.on_batch_delivered([entry(B, true), entry(A, true), entry(C, false)]);
    assert_eq!(report.notified, 1);
    assert_eq!(log.calls(), vec![(A, true)]);
    assert_eq!(registry.visible_elements().copied().collect::<Vec<_>>(), vec![A]);
}

#[test]
fn only_targets_in_the_batch_are_notified() {
    let (mut registry, _probe) = recording_registry();
    let log = CallbackLog::new();
    registry
        .add_element(A, log.callback(A))
        .unwrap()
        .add_element_with(B, log.callback(B), ObserveOptions::new().with_margin("50px"))
        .unwrap();

    registry.on_batch_delivered([entry(A, true), entry(B, true)]);
    log.take();

    // A batch from the default context alone must not re-notify B.
    registry.on_batch_delivered([entry(A, false)]);
    assert_eq!(log.calls(), vec![(A, false)]);
}

#[test]
fn repeated_target_in_one_batch_settles_on_last_entry() {
    let (mut registry, _probe) = recording_registry();
    let log = CallbackLog::new();
    registry.add_element(A, log.callback(A)).unwrap();

    registry.on_batch_delivered([entry(A, true), entry(A, false)]);
    assert!(log.is_empty());

    registry.on_batch_delivered([entry(A, false), entry(A, true), entry(A, true)]);
    assert_eq!(log.calls(), vec![(A, true)]);
    assert_eq!(registry.registrant(&A).map(|r| r.previous_visibility()), Some(false));
}

#[test]
fn dispatch_follows_insertion_order() {
    let (mut registry, _probe) = recording_registry();
    let log = CallbackLog::new();
    for id in [C, A, B] {
        registry.add_element(id, log.callback(id)).unwrap();
    }

    registry.on_batch_delivered([entry(A, true), entry(B, true), entry(C, true)]);
    assert_eq!(log.calls(), vec![(C, true), (A, true), (B, true)]);
}

#[test]
fn panicking_callback_does_not_stop_dispatch() {
    init_test_tracing();
    let (mut registry, _probe) = recording_registry();
    let log = CallbackLog::new();
    registry
        .add_element(A, |_| panic!("render failed"))
        .unwrap()
        .add_element(B, log.callback(B))
        .unwrap();

    let report = registry.on_batch_delivered([entry(A, true), entry(B, true)]);
    assert_eq!(report.notified, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, A);
    assert!(report.failures[0].message.contains("render failed"));
    assert_eq!(log.calls(), vec![(B, true)]);
    assert_eq!(registry.visibility(&A), Some(true));
}

#[test]
fn idle_contexts_are_released_and_recreated() {
    let (mut registry, probe) = recording_registry();
    registry.add_element(A, |_| {}).unwrap();
    registry.remove_element(&A);

    assert_eq!(registry.context_count(), 0);
    assert_eq!(probe.live_contexts(), 0);
    assert!(
        probe
            .events()
            .contains(&HostEvent::Disconnect { context: 0 })
    );

    registry.add_element(A, |_| {}).unwrap();
    assert_eq!(probe.created_count(), 2);
    assert_eq!(probe.live_contexts(), 1);
}

#[test]
fn retained_contexts_survive_churn() {
    let config = RegistryConfig::new().with_retention(ContextRetention::Retain);
    let host = RecordingHost::new();
    let probe = host.probe();
    let mut registry = VisibilityRegistry::with_config(host, config).unwrap();

    for _ in 0..5 {
        registry.add_element(A, |_| {}).unwrap();
        registry.remove_element(&A);
    }
    assert_eq!(probe.created_count(), 1);
    assert_eq!(registry.context_watch_count(&ContextKey::default()), Some(0));
}

#[test]
fn host_rejection_reaches_the_caller() {
    let host = RecordingHost::new()
        .reject_margin("bogus")
        .reject_target(B);
    let probe = host.probe();
    let mut registry = VisibilityRegistry::new(host);

    let err = registry
        .add_element_with(A, |_| {}, ObserveOptions::new().with_margin("bogus"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::Host(HostError::InvalidConfig(_))));
    assert_eq!(probe.created_count(), 0);

    let err = registry.add_element(B, |_| {}).unwrap_err();
    assert!(matches!(err, RegistryError::Host(HostError::Unavailable(_))));
    assert!(!registry.contains(&B));
    assert_eq!(registry.context_count(), 0);
    assert_eq!(probe.live_contexts(), 0);
}

#[test]
fn clear_unbinds_everything() {
    let (mut registry, probe) = recording_registry();
    registry
        .add_elements([A, B], |_| {}, ObserveOptions::new())
        .unwrap()
        .add_element_with(C, |_| {}, ObserveOptions::new().with_margin("5px"))
        .unwrap();

    registry.clear();
    assert!(registry.is_empty());
    assert_eq!(registry.context_count(), 0);
    assert!(probe.watched().is_empty());
}

#[test]
fn evidence_log_records_transitions_and_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evidence.jsonl");
    let config = RegistryConfig::new().with_evidence(EvidenceSinkConfig::enabled_file(&path));
    let mut registry = VisibilityRegistry::with_config(RecordingHost::new(), config).unwrap();
    registry
        .add_element(A, |_| {})
        .unwrap()
        .add_element(B, |_| panic!("boom"))
        .unwrap();

    registry.on_batch_delivered([entry(A, true), entry(B, true)]);

    let text = std::fs::read_to_string(&path).unwrap();
    let events: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let kinds: Vec<&str> = events
        .iter()
        .map(|event| event["event"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec![
        "visibility_transition",
        "visibility_transition",
        "callback_failure",
    ]);
    assert_eq!(events[2]["message"], "boom");
}

#[test]
fn independent_registries_do_not_interact() {
    let (mut first, _) = recording_registry();
    let (mut second, _) = recording_registry();
    let log = CallbackLog::new();
    first.add_element(A, log.callback(A)).unwrap();
    second.add_element(A, |_| panic!("wrong registry")).unwrap();

    let report = first.on_batch_delivered([entry(A, true)]);
    assert!(report.is_clean());
    assert_eq!(second.visibility(&A), Some(false));
    assert_eq!(log.calls(), vec![(A, true)]);
}
