#![forbid(unsafe_code)]

//! Test harness and reference fixtures for sightline.
//!
//! # Role in sightline
//! `sightline-harness` provides a host that needs no browser, so registry
//! behavior can be exercised deterministically: which contexts were created,
//! which elements were watched through them, and which callbacks fired for a
//! scripted sequence of batches.
//!
//! # Primary responsibilities
//! - **RecordingHost / HostProbe**: a recording [`ObservationHost`] with
//!   failure injection and queued initial notifications.
//! - **CallbackLog**: records `(element, visible)` invocations in order.
//! - **init_test_tracing**: one-time `tracing` subscriber for tests.
//!
//! [`ObservationHost`]: sightline_core::ObservationHost

pub mod callback_log;
pub mod logging;
pub mod recording_host;

pub use callback_log::CallbackLog;
pub use logging::init_test_tracing;
pub use recording_host::{
    ElementId, FrameId, HostEvent, HostProbe, RecordingContext, RecordingHost, entry,
};

/// Registry over a fresh [`RecordingHost`], plus a probe into it.
#[must_use]
pub fn recording_registry() -> (sightline_core::VisibilityRegistry<RecordingHost>, HostProbe) {
    let host = RecordingHost::new();
    let probe = host.probe();
    (sightline_core::VisibilityRegistry::new(host), probe)
}
