//! Host-driven delivery through `SharedRegistry`.
//!
//! The recording host queues an initial entry per watched element and only
//! delivers when the test flushes it, mirroring a browser that reports
//! initial intersection state asynchronously after `observe`.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use sightline_core::{DispatchStats, ObserveOptions, SharedRegistry};
use sightline_harness::{
    CallbackLog, ElementId, HostProbe, RecordingHost, entry, init_test_tracing,
};

const A: ElementId = ElementId(1);
const B: ElementId = ElementId(2);
const C: ElementId = ElementId(3);

fn shared_with_initial(visible: bool) -> (SharedRegistry<RecordingHost>, HostProbe) {
    init_test_tracing();
    let probe = Rc::new(RefCell::new(None));
    let probe_slot = Rc::clone(&probe);
    let registry = SharedRegistry::new(move |dispatcher| {
        let host = RecordingHost::connected(dispatcher).with_initial_notification(visible);
        *probe_slot.borrow_mut() = Some(host.probe());
        host
    });
    let probe = probe.borrow_mut().take().unwrap();
    (registry, probe)
}

#[test]
fn initial_notifications_arrive_on_flush() {
    let (registry, probe) = shared_with_initial(true);
    let log = CallbackLog::new();
    registry
        .add_element(A, log.callback(A))
        .unwrap()
        .add_element(B, log.callback(B))
        .unwrap();

    assert!(log.is_empty());
    assert_eq!(probe.queued(), 2);

    assert!(probe.flush());
    assert_eq!(log.calls(), vec![(A, true), (B, true)]);
    assert_eq!(registry.stats(), DispatchStats {
        batches: 1,
        notified: 2,
        released: 0,
        failures: 0,
    });
}

#[test]
fn initially_hidden_elements_stay_silent() {
    let (registry, probe) = shared_with_initial(false);
    let log = CallbackLog::new();
    registry.add_element(A, log.callback(A)).unwrap();

    probe.flush();
    assert!(log.is_empty());
    assert_eq!(registry.visibility(&A), Some(false));
}

#[test]
fn lazy_load_pattern_releases_after_first_sight() {
    let (registry, probe) = shared_with_initial(false);
    let loaded = CallbackLog::new();
    registry
        .add_elements([A, B, C], loaded.callback(ElementId(0)), ObserveOptions::new().once())
        .unwrap();
    probe.flush();

    probe.deliver([entry(B, true)]);
    assert_eq!(loaded.len(), 1);
    assert!(!registry.contains(&B));
    assert_eq!(probe.watched(), vec![A, C]);

    probe.deliver([entry(A, true), entry(B, true), entry(C, true)]);
    assert_eq!(loaded.len(), 3);
    assert!(registry.is_empty());
    assert_eq!(probe.live_contexts(), 0);
    assert_eq!(registry.stats().released, 3);
}

#[test]
fn callback_can_register_a_follow_up_element() {
    let (registry, probe) = shared_with_initial(true);
    let log = CallbackLog::new();
    let handle = registry.downgrade();
    let follow_up = log.callback(B);
    let follow_up = Rc::new(follow_up);
    registry
        .add_element_with(
            A,
            move |visible| {
                if visible && let Some(registry) = handle.upgrade() {
                    let follow_up = Rc::clone(&follow_up);
                    registry.add_element(B, move |v| follow_up(v)).unwrap();
                }
            },
            ObserveOptions::new().once(),
        )
        .unwrap();

    // First flush delivers A; the callback watches B, queueing its entry.
    probe.flush();
    assert!(!registry.contains(&A));
    assert!(registry.contains(&B));
    assert_eq!(probe.queued(), 1);

    probe.flush();
    assert_eq!(log.calls(), vec![(B, true)]);
}

#[test]
fn delivery_after_registry_drop_is_discarded() {
    let (registry, probe) = shared_with_initial(true);
    let log = CallbackLog::new();
    registry.add_element(A, log.callback(A)).unwrap();
    drop(registry);

    assert!(probe.flush());
    assert!(log.is_empty());
}

#[test]
fn panics_in_shared_dispatch_are_counted() {
    let (registry, probe) = shared_with_initial(true);
    let log = CallbackLog::new();
    registry
        .add_element(A, |_| panic!("listener exploded"))
        .unwrap()
        .add_element(B, log.callback(B))
        .unwrap();

    probe.flush();
    assert_eq!(registry.stats().failures, 1);
    assert_eq!(log.calls(), vec![(B, true)]);
}
