#![forbid(unsafe_code)]

//! Deterministic recording host.
//!
//! [`RecordingHost`] implements [`ObservationHost`] without any geometry. It
//! records every context creation, watch, unwatch, and disconnect as a
//! [`HostEvent`], and can simulate the browser's behavior of queueing an
//! initial entry for each newly watched element. Queued entries are only
//! delivered when a test calls [`HostProbe::flush`], which keeps delivery
//! asynchronous with respect to registration.
//!
//! The host moves into the registry; tests keep a [`HostProbe`] (a shared
//! view of the same state) to inspect and drive it.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use sightline_core::{
    BatchDispatcher, ContextKey, HostError, IntersectionEntry, ObservationContext,
    ObservationHost, RootMargin,
};
use tracing::trace;

/// Element handle used by the recording host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u32);

/// Reference-frame handle with identity semantics: every [`FrameId::fresh`]
/// call yields a frame distinct from all others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

impl FrameId {
    #[must_use]
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Entry for `target` fully in view (`true`) or out of view (`false`).
#[must_use]
pub fn entry(target: ElementId, visible: bool) -> IntersectionEntry<ElementId> {
    IntersectionEntry::new(target, visible)
}

/// One recorded host interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Created {
        context: usize,
        key: ContextKey<FrameId>,
    },
    Watch {
        context: usize,
        target: ElementId,
    },
    Unwatch {
        context: usize,
        target: ElementId,
    },
    Disconnect {
        context: usize,
    },
}

#[derive(Default)]
struct HostState {
    events: Vec<HostEvent>,
    next_context: usize,
    watching: BTreeMap<usize, BTreeSet<ElementId>>,
    rejected_margins: Vec<RootMargin>,
    rejected_targets: HashSet<ElementId>,
    initial_visibility: Option<bool>,
    queued: Vec<IntersectionEntry<ElementId>>,
    dispatcher: Option<BatchDispatcher<RecordingHost>>,
}

/// Recording [`ObservationHost`] for tests.
pub struct RecordingHost {
    state: Rc<RefCell<HostState>>,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordingHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("RecordingHost")
            .field("events", &state.events.len())
            .field("live_contexts", &state.watching.len())
            .finish_non_exhaustive()
    }
}

impl RecordingHost {
    /// Host without a dispatcher; drive the registry with
    /// `on_batch_delivered` directly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(HostState::default())),
        }
    }

    /// Host that delivers through `dispatcher` (see
    /// [`SharedRegistry::new`](sightline_core::SharedRegistry::new)).
    #[must_use]
    pub fn connected(dispatcher: BatchDispatcher<RecordingHost>) -> Self {
        let host = Self::new();
        host.state.borrow_mut().dispatcher = Some(dispatcher);
        host
    }

    /// Reject contexts whose margin equals `margin`.
    #[must_use]
    pub fn reject_margin(self, margin: impl Into<RootMargin>) -> Self {
        self.state.borrow_mut().rejected_margins.push(margin.into());
        self
    }

    /// Fail every watch request for `target`.
    #[must_use]
    pub fn reject_target(self, target: ElementId) -> Self {
        self.state.borrow_mut().rejected_targets.insert(target);
        self
    }

    /// Queue an initial entry with `visible` for each newly watched element.
    #[must_use]
    pub fn with_initial_notification(self, visible: bool) -> Self {
        self.state.borrow_mut().initial_visibility = Some(visible);
        self
    }

    #[must_use]
    pub fn probe(&self) -> HostProbe {
        HostProbe {
            state: Rc::clone(&self.state),
        }
    }
}

/// Context created by [`RecordingHost`].
pub struct RecordingContext {
    id: usize,
    state: Rc<RefCell<HostState>>,
}

impl std::fmt::Debug for RecordingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl RecordingContext {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl ObservationContext<ElementId> for RecordingContext {
    fn watch(&mut self, target: &ElementId) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        if state.rejected_targets.contains(target) {
            return Err(HostError::Unavailable(format!("{target:?} is detached")));
        }
        state.events.push(HostEvent::Watch {
            context: self.id,
            target: *target,
        });
        state.watching.entry(self.id).or_default().insert(*target);
        if let Some(visible) = state.initial_visibility {
            state.queued.push(entry(*target, visible));
        }
        Ok(())
    }

    fn unwatch(&mut self, target: &ElementId) {
        let mut state = self.state.borrow_mut();
        state.events.push(HostEvent::Unwatch {
            context: self.id,
            target: *target,
        });
        if let Some(watched) = state.watching.get_mut(&self.id) {
            watched.remove(target);
        }
    }

    fn disconnect(&mut self) {
        let mut state = self.state.borrow_mut();
        state.events.push(HostEvent::Disconnect { context: self.id });
        state.watching.remove(&self.id);
    }
}

impl ObservationHost for RecordingHost {
    type Element = ElementId;
    type Frame = FrameId;
    type Context = RecordingContext;

    fn create_context(
        &mut self,
        key: &ContextKey<FrameId>,
    ) -> Result<RecordingContext, HostError> {
        let mut state = self.state.borrow_mut();
        if state.rejected_margins.contains(&key.margin) {
            return Err(HostError::InvalidConfig(format!(
                "rootMargin {:?} is not a valid margin",
                key.margin.as_str()
            )));
        }
        let id = state.next_context;
        state.next_context += 1;
        state.events.push(HostEvent::Created {
            context: id,
            key: key.clone(),
        });
        state.watching.insert(id, BTreeSet::new());
        Ok(RecordingContext {
            id,
            state: Rc::clone(&self.state),
        })
    }
}

/// Shared view of a [`RecordingHost`]'s state.
#[derive(Clone)]
pub struct HostProbe {
    state: Rc<RefCell<HostState>>,
}

impl std::fmt::Debug for HostProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProbe").finish_non_exhaustive()
    }
}

impl HostProbe {
    /// Every recorded interaction, in order.
    #[must_use]
    pub fn events(&self) -> Vec<HostEvent> {
        self.state.borrow().events.clone()
    }

    /// Contexts ever created.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.state.borrow().next_context
    }

    /// Contexts created and not yet disconnected.
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.state.borrow().watching.len()
    }

    /// Watch calls ever made.
    #[must_use]
    pub fn watch_calls(&self) -> usize {
        self.state
            .borrow()
            .events
            .iter()
            .filter(|event| matches!(event, HostEvent::Watch { .. }))
            .count()
    }

    /// Elements currently watched by any context, sorted.
    #[must_use]
    pub fn watched(&self) -> Vec<ElementId> {
        let state = self.state.borrow();
        let all: BTreeSet<ElementId> = state.watching.values().flatten().copied().collect();
        all.into_iter().collect()
    }

    /// Entries waiting for [`flush`](Self::flush).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.borrow().queued.len()
    }

    /// Deliver all queued entries as one batch. Returns `false` if nothing
    /// was queued or the host has no dispatcher.
    pub fn flush(&self) -> bool {
        let (dispatcher, batch) = {
            let mut state = self.state.borrow_mut();
            if state.queued.is_empty() {
                return false;
            }
            let Some(dispatcher) = state.dispatcher.clone() else {
                return false;
            };
            (dispatcher, std::mem::take(&mut state.queued))
        };
        trace!(entries = batch.len(), "flushing queued entries");
        dispatcher.deliver(batch);
        true
    }

    /// Deliver `entries` through the host's dispatcher. Returns `false` if
    /// the host has no dispatcher.
    pub fn deliver<I>(&self, entries: I) -> bool
    where
        I: IntoIterator<Item = IntersectionEntry<ElementId>>,
    {
        let dispatcher = self.state.borrow().dispatcher.clone();
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.deliver(entries);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_core::{ObserveOptions, VisibilityRegistry};

    #[test]
    fn fresh_frames_are_distinct() {
        assert_ne!(FrameId::fresh(), FrameId::fresh());
    }

    #[test]
    fn records_lifecycle_events() {
        let host = RecordingHost::new();
        let probe = host.probe();
        let mut registry = VisibilityRegistry::new(host);

        registry.add_element(ElementId(1), |_| {}).unwrap();
        registry.remove_element(&ElementId(1));

        assert_eq!(probe.events(), vec![
            HostEvent::Created {
                context: 0,
                key: ContextKey::default(),
            },
            HostEvent::Watch {
                context: 0,
                target: ElementId(1),
            },
            HostEvent::Unwatch {
                context: 0,
                target: ElementId(1),
            },
            HostEvent::Disconnect { context: 0 },
        ]);
        assert_eq!(probe.live_contexts(), 0);
    }

    #[test]
    fn context_debug_names_its_id() {
        let mut host = RecordingHost::new();
        let context = host.create_context(&ContextKey::default()).unwrap();
        assert_eq!(context.id(), 0);
        assert_eq!(format!("{context:?}"), "RecordingContext { id: 0, .. }");
    }

    #[test]
    fn rejects_configured_margin() {
        let host = RecordingHost::new().reject_margin("oops");
        let mut registry = VisibilityRegistry::new(host);
        let result = registry.add_element_with(
            ElementId(1),
            |_| {},
            ObserveOptions::new().with_margin("oops"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn flush_without_dispatcher_is_refused() {
        let host = RecordingHost::new().with_initial_notification(true);
        let probe = host.probe();
        let mut registry = VisibilityRegistry::new(host);
        registry.add_element(ElementId(1), |_| {}).unwrap();
        assert_eq!(probe.queued(), 1);
        assert!(!probe.flush());
        assert!(!probe.deliver([entry(ElementId(1), true)]));
    }
}
