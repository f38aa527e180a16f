#![forbid(unsafe_code)]

//! Core: visibility registry, observation context keys, and host capability.
//!
//! # Role in sightline
//! `sightline-core` multiplexes a host's native "observe region, get
//! notified of intersection entries" primitive. It deduplicates observation
//! contexts by (frame, margin, threshold), tracks per-element visibility
//! across delivered batches, and fires a callback exactly once per
//! visible/not-visible transition.
//!
//! # Primary responsibilities
//! - **VisibilityRegistry**: registration, context reference counting, and
//!   two-phase batch processing with isolated callback dispatch.
//! - **SharedRegistry / BatchDispatcher**: host-driven delivery with
//!   re-entrant callbacks.
//! - **ObservationHost / ObservationContext**: the capability a host
//!   implements.
//! - **RegistryConfig / EvidenceSink**: configuration and JSONL diagnostics.
//!
//! # How it fits in the system
//! `sightline-web` implements the host traits over the browser's
//! `IntersectionObserver`; `sightline-harness` implements them with a
//! deterministic recording host for tests. Geometry is never computed here.
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use sightline_core::{
//!     ContextKey, HostError, IntersectionEntry, ObservationContext, ObservationHost,
//!     VisibilityRegistry,
//! };
//!
//! struct NullHost;
//! struct NullContext;
//!
//! impl ObservationContext<u32> for NullContext {
//!     fn watch(&mut self, _target: &u32) -> Result<(), HostError> {
//!         Ok(())
//!     }
//!     fn unwatch(&mut self, _target: &u32) {}
//! }
//!
//! impl ObservationHost for NullHost {
//!     type Element = u32;
//!     type Frame = u32;
//!     type Context = NullContext;
//!
//!     fn create_context(&mut self, _key: &ContextKey<u32>) -> Result<NullContext, HostError> {
//!         Ok(NullContext)
//!     }
//! }
//!
//! let seen = Rc::new(Cell::new(None));
//! let seen_clone = Rc::clone(&seen);
//! let mut registry = VisibilityRegistry::new(NullHost);
//! registry
//!     .add_element(1, move |visible| seen_clone.set(Some(visible)))
//!     .unwrap();
//!
//! registry.on_batch_delivered([IntersectionEntry::new(1, true)]);
//! assert_eq!(seen.get(), Some(true));
//! ```

pub mod config;
pub mod error;
pub mod evidence_sink;
pub mod host;
pub mod key;
pub mod registry;
pub mod shared;

pub use config::{ContextRetention, RegistryConfig};
pub use error::RegistryError;
pub use evidence_sink::{EvidenceSink, EvidenceSinkConfig, EvidenceSinkDestination};
pub use host::{HostError, IntersectionEntry, ObservationContext, ObservationHost};
pub use key::{ContextKey, ObserveOptions, RootMargin, Threshold};
pub use registry::{
    CallbackFailure, DispatchReport, Registrant, VisibilityCallback, VisibilityRegistry,
};
pub use shared::{BatchDispatcher, DispatchStats, SharedRegistry, WeakRegistry};
