#![forbid(unsafe_code)]

//! Visibility registry: context deduplication, per-element state, and
//! edge-triggered dispatch.
//!
//! # Design
//!
//! [`VisibilityRegistry`] owns the host capability and three maps:
//!
//! - `contexts`: one [`ObservationContext`] per distinct [`ContextKey`], with
//!   a count of the elements it watches.
//! - `registry`: each bound element's [`Registrant`], in insertion order.
//! - `visible`: elements reported intersecting by the most recent batch.
//!
//! A delivered batch is processed in two phases. The update phase writes
//! `previous_visibility` and `visibility` for every registered target in the
//! batch. The dispatch phase then walks the registry in insertion order and
//! invokes the callback of every registrant updated by this batch whose
//! visibility changed. Registrants untouched by the batch are never
//! re-notified, so each transition fires exactly once.
//!
//! If a batch mentions the same target more than once, `previous_visibility`
//! is captured on the first mention and `visibility` is taken from the last.
//!
//! # Failure Modes
//!
//! - **Panicking callback**: caught at the per-registrant boundary, logged
//!   with `tracing::error!`, and returned in [`DispatchReport::failures`].
//!   Remaining registrants are still notified.
//! - **Host rejection**: [`HostError`] from context creation or `watch` is
//!   returned from the registration call; nothing is stored.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, error, trace, trace_span, warn};

use crate::config::{ContextRetention, RegistryConfig};
use crate::error::RegistryError;
use crate::evidence_sink::EvidenceSink;
use crate::host::{HostError, IntersectionEntry, ObservationContext, ObservationHost};
use crate::key::{ContextKey, ObserveOptions};

/// Callback invoked with the new visibility on each transition.
pub type VisibilityCallback = Rc<dyn Fn(bool)>;

/// Context handle plus the number of registrants watching through it.
struct ContextSlot<C> {
    context: C,
    watching: usize,
}

/// Registry record for one bound element.
pub struct Registrant<F, E> {
    callback: VisibilityCallback,
    key: ContextKey<F>,
    once: bool,
    visibility: bool,
    previous_visibility: bool,
    last_entry: Option<IntersectionEntry<E>>,
    /// Sequence number of the last batch that updated this registrant.
    batch: u64,
}

impl<F, E> Registrant<F, E> {
    fn new(callback: VisibilityCallback, key: ContextKey<F>, once: bool) -> Self {
        Self {
            callback,
            key,
            once,
            visibility: false,
            previous_visibility: false,
            last_entry: None,
            batch: 0,
        }
    }

    #[must_use]
    pub fn visibility(&self) -> bool {
        self.visibility
    }

    #[must_use]
    pub fn previous_visibility(&self) -> bool {
        self.previous_visibility
    }

    /// Most recent raw entry for this element, if any batch included it.
    #[must_use]
    pub fn last_entry(&self) -> Option<&IntersectionEntry<E>> {
        self.last_entry.as_ref()
    }

    /// Context key this registrant is watched through.
    #[must_use]
    pub fn key(&self) -> &ContextKey<F> {
        &self.key
    }

    #[must_use]
    pub fn is_once(&self) -> bool {
        self.once
    }
}

impl<F: std::fmt::Debug, E: std::fmt::Debug> std::fmt::Debug for Registrant<F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrant")
            .field("key", &self.key)
            .field("once", &self.once)
            .field("visibility", &self.visibility)
            .field("previous_visibility", &self.previous_visibility)
            .field("last_entry", &self.last_entry)
            .finish_non_exhaustive()
    }
}

/// A callback that panicked during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure<E> {
    pub target: E,
    /// Visibility the callback was invoked with.
    pub visible: bool,
    pub message: String,
}

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport<E> {
    /// Callbacks invoked, including ones that panicked.
    pub notified: usize,
    /// One-shot registrants removed after their transition.
    pub released: usize,
    pub failures: Vec<CallbackFailure<E>>,
}

impl<E> Default for DispatchReport<E> {
    fn default() -> Self {
        Self {
            notified: 0,
            released: 0,
            failures: Vec::new(),
        }
    }
}

impl<E> DispatchReport<E> {
    /// True when every invoked callback returned normally.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A pending callback invocation computed by the update phase.
pub(crate) struct Notification<E> {
    pub(crate) target: E,
    pub(crate) visible: bool,
    pub(crate) ratio: f64,
    pub(crate) once: bool,
    pub(crate) callback: VisibilityCallback,
    pub(crate) batch: u64,
}

/// Invoke `callback` inside its own unwind boundary.
pub(crate) fn invoke_isolated(callback: &VisibilityCallback, visible: bool) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(|| callback(visible))).map_err(|payload| panic_message(&*payload))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Multiplexes host observation contexts and dispatches edge-triggered
/// visibility callbacks.
///
/// # Invariants
///
/// 1. An element has at most one registrant.
/// 2. Structurally equal [`ContextKey`]s share one context.
/// 3. A registrant's callback fires once per visibility transition.
/// 4. With [`ContextRetention::Release`], every live context watches at
///    least one element, unless it was resolved directly through
///    [`resolve_context`](Self::resolve_context) and never used.
pub struct VisibilityRegistry<H: ObservationHost> {
    host: H,
    config: RegistryConfig,
    evidence: Option<EvidenceSink>,
    contexts: HashMap<ContextKey<H::Frame>, ContextSlot<H::Context>>,
    registry: IndexMap<H::Element, Registrant<H::Frame, H::Element>>,
    visible: HashSet<H::Element>,
    batch_seq: u64,
}

impl<H: ObservationHost> std::fmt::Debug for VisibilityRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityRegistry")
            .field("registrants", &self.registry.len())
            .field("contexts", &self.contexts.len())
            .field("visible", &self.visible.len())
            .field("batch_seq", &self.batch_seq)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<H: ObservationHost> VisibilityRegistry<H> {
    /// Create a registry with the default configuration.
    #[must_use]
    pub fn new(host: H) -> Self {
        Self::from_parts(host, RegistryConfig::default(), None)
    }

    /// Create a registry with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Evidence`] if the evidence sink is enabled
    /// and cannot be opened.
    pub fn with_config(host: H, config: RegistryConfig) -> Result<Self, RegistryError> {
        let evidence = EvidenceSink::from_config(&config.evidence)?;
        Ok(Self::from_parts(host, config, evidence))
    }

    pub(crate) fn from_parts(
        host: H,
        config: RegistryConfig,
        evidence: Option<EvidenceSink>,
    ) -> Self {
        Self {
            host,
            config,
            evidence,
            contexts: HashMap::new(),
            registry: IndexMap::new(),
            visible: HashSet::new(),
            batch_seq: 0,
        }
    }

    /// Attach an evidence sink, replacing any configured one.
    #[must_use]
    pub fn with_evidence_sink(mut self, sink: EvidenceSink) -> Self {
        self.evidence = Some(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    // -----------------------------------------------------------------------
    // Contexts
    // -----------------------------------------------------------------------

    /// Return the context for `key`, creating it through the host on first
    /// use.
    ///
    /// # Errors
    ///
    /// Propagates the host's rejection of the configuration.
    pub fn resolve_context(
        &mut self,
        key: &ContextKey<H::Frame>,
    ) -> Result<&mut H::Context, HostError> {
        self.resolve_slot(key).map(|slot| &mut slot.context)
    }

    fn resolve_slot(
        &mut self,
        key: &ContextKey<H::Frame>,
    ) -> Result<&mut ContextSlot<H::Context>, HostError> {
        match self.contexts.entry(key.clone()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(vacant) => {
                let context = self.host.create_context(key)?;
                debug!(
                    frame = ?key.frame,
                    margin = %key.margin,
                    threshold = ?key.threshold,
                    "created observation context"
                );
                Ok(vacant.insert(ContextSlot {
                    context,
                    watching: 0,
                }))
            }
        }
    }

    /// Number of live contexts.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Number of elements watched through the context for `key`, or `None`
    /// if no such context is live.
    #[must_use]
    pub fn context_watch_count(&self, key: &ContextKey<H::Frame>) -> Option<usize> {
        self.contexts.get(key).map(|slot| slot.watching)
    }

    fn release_if_idle(&mut self, key: &ContextKey<H::Frame>) {
        if self.config.retention == ContextRetention::Retain {
            return;
        }
        if self.contexts.get(key).is_some_and(|slot| slot.watching == 0)
            && let Some(mut slot) = self.contexts.remove(key)
        {
            slot.context.disconnect();
            debug!(frame = ?key.frame, margin = %key.margin, "released idle observation context");
        }
    }

    fn unwatch(&mut self, key: &ContextKey<H::Frame>, element: &H::Element) {
        let Some(slot) = self.contexts.get_mut(key) else {
            return;
        };
        slot.context.unwatch(element);
        slot.watching = slot.watching.saturating_sub(1);
        self.release_if_idle(key);
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Bind `element` with default options. Chainable.
    ///
    /// Re-adding a registered element is a no-op: the existing callback and
    /// options are kept. Use [`register`](Self::register) to reject
    /// duplicates or [`replace_element`](Self::replace_element) to swap them.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] if the host rejects the configuration
    /// or the watch request.
    pub fn add_element(
        &mut self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.add_element_with(element, callback, ObserveOptions::default())
    }

    /// Bind `element` with explicit options. Chainable; idempotent per
    /// element like [`add_element`](Self::add_element).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] if the host rejects the configuration
    /// or the watch request.
    pub fn add_element_with(
        &mut self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&mut Self, RegistryError> {
        self.insert(element, Rc::new(callback), options, false)?;
        Ok(self)
    }

    /// Bind every element of `elements`, in order, with one shared callback
    /// and the same options.
    ///
    /// Stops at the first host error; elements before it stay registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] if the host rejects the configuration
    /// or a watch request.
    pub fn add_elements<I>(
        &mut self,
        elements: I,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&mut Self, RegistryError>
    where
        I: IntoIterator<Item = H::Element>,
    {
        let callback: VisibilityCallback = Rc::new(callback);
        for element in elements {
            self.insert(element, Rc::clone(&callback), options.clone(), false)?;
        }
        Ok(self)
    }

    /// Bind `element`, rejecting duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `element` is bound,
    /// or [`RegistryError::Host`] on host rejection.
    pub fn register(
        &mut self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&mut Self, RegistryError> {
        self.insert(element, Rc::new(callback), options, true)?;
        Ok(self)
    }

    /// Replace the registrant for `element` (or bind it if absent). The new
    /// registrant starts not-visible.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] on host rejection; the previous
    /// registrant is already gone in that case.
    pub fn replace_element(
        &mut self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&mut Self, RegistryError> {
        self.remove_element(&element);
        self.insert(element, Rc::new(callback), options, true)?;
        Ok(self)
    }

    fn insert(
        &mut self,
        element: H::Element,
        callback: VisibilityCallback,
        options: ObserveOptions<H::Frame>,
        strict: bool,
    ) -> Result<(), RegistryError> {
        if self.registry.contains_key(&element) {
            if strict {
                return Err(RegistryError::AlreadyRegistered {
                    target: format!("{element:?}"),
                });
            }
            debug!(target = ?element, "element already registered; ignoring");
            return Ok(());
        }

        let (key, once) = options.into_parts();
        let slot = self.resolve_slot(&key)?;
        if let Err(err) = slot.context.watch(&element) {
            self.release_if_idle(&key);
            return Err(err.into());
        }
        slot.watching += 1;
        trace!(target = ?element, once, "registered element");
        self.registry
            .insert(element, Registrant::new(callback, key, once));
        Ok(())
    }

    /// Unbind `element`. Returns `false` if it was not registered.
    pub fn remove_element(&mut self, element: &H::Element) -> bool {
        let Some(registrant) = self.registry.shift_remove(element) else {
            return false;
        };
        self.visible.remove(element);
        self.unwatch(&registrant.key, element);
        trace!(target = ?element, "removed element");
        true
    }

    /// Unbind every element.
    pub fn clear(&mut self) {
        let elements: Vec<H::Element> = self.registry.keys().cloned().collect();
        for element in &elements {
            self.remove_element(element);
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn contains(&self, element: &H::Element) -> bool {
        self.registry.contains_key(element)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    #[must_use]
    pub fn registrant(&self, element: &H::Element) -> Option<&Registrant<H::Frame, H::Element>> {
        self.registry.get(element)
    }

    /// Current visibility of a registered element.
    #[must_use]
    pub fn visibility(&self, element: &H::Element) -> Option<bool> {
        self.registry.get(element).map(Registrant::visibility)
    }

    #[must_use]
    pub fn last_entry(&self, element: &H::Element) -> Option<&IntersectionEntry<H::Element>> {
        self.registry.get(element).and_then(Registrant::last_entry)
    }

    /// Elements reported intersecting by the most recent batch.
    pub fn visible_elements(&self) -> impl Iterator<Item = &H::Element> {
        self.visible.iter()
    }

    /// Registered elements in insertion order.
    pub fn elements(&self) -> impl Iterator<Item = &H::Element> {
        self.registry.keys()
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Process one batch delivered by the host and dispatch callbacks.
    ///
    /// Callbacks run while the registry is exclusively borrowed. Use
    /// [`SharedRegistry`](crate::SharedRegistry) when callbacks need to
    /// register or remove elements.
    pub fn on_batch_delivered<I>(&mut self, entries: I) -> DispatchReport<H::Element>
    where
        I: IntoIterator<Item = IntersectionEntry<H::Element>>,
    {
        let notifications = self.apply_batch(entries);
        let mut report = DispatchReport::default();
        for notification in notifications {
            let outcome = invoke_isolated(&notification.callback, notification.visible);
            self.settle(&notification, outcome, &mut report);
        }
        report
    }

    /// Update phase: write visibility for every registered target in the
    /// batch, then collect the registrants that transitioned.
    pub(crate) fn apply_batch<I>(&mut self, entries: I) -> Vec<Notification<H::Element>>
    where
        I: IntoIterator<Item = IntersectionEntry<H::Element>>,
    {
        self.batch_seq += 1;
        let batch = self.batch_seq;
        self.visible.clear();

        let _span = trace_span!("visibility_batch", batch, registrants = self.registry.len())
            .entered();

        let mut delivered = 0usize;
        for entry in entries {
            delivered += 1;
            let Some(registrant) = self.registry.get_mut(&entry.target) else {
                continue;
            };
            if registrant.batch != batch {
                registrant.previous_visibility = registrant.visibility;
                registrant.batch = batch;
            }
            registrant.visibility = entry.is_intersecting;
            if entry.is_intersecting {
                self.visible.insert(entry.target.clone());
            } else {
                self.visible.remove(&entry.target);
            }
            registrant.last_entry = Some(entry);
        }

        let notifications: Vec<_> = self
            .registry
            .iter()
            .filter(|(_, r)| r.batch == batch && r.visibility != r.previous_visibility)
            .map(|(element, r)| Notification {
                target: element.clone(),
                visible: r.visibility,
                ratio: r
                    .last_entry
                    .as_ref()
                    .map_or(0.0, |entry| entry.intersection_ratio),
                once: r.once,
                callback: Rc::clone(&r.callback),
                batch,
            })
            .collect();
        trace!(delivered, transitions = notifications.len(), "applied batch");
        notifications
    }

    /// True if `notification` still belongs to a live registrant: removed or
    /// replaced registrants are skipped.
    pub(crate) fn is_current(&self, notification: &Notification<H::Element>) -> bool {
        self.registry
            .get(&notification.target)
            .is_some_and(|r| Rc::ptr_eq(&r.callback, &notification.callback))
    }

    /// Dispatch-phase bookkeeping after a callback returned (or panicked).
    pub(crate) fn settle(
        &mut self,
        notification: &Notification<H::Element>,
        outcome: Result<(), String>,
        report: &mut DispatchReport<H::Element>,
    ) {
        report.notified += 1;
        let label = format!("{:?}", notification.target);

        if let Some(sink) = &self.evidence
            && let Err(err) = sink.write_transition(
                notification.batch,
                &label,
                notification.visible,
                notification.ratio,
                notification.once,
            )
        {
            warn!(error = %err, "failed to write visibility evidence");
        }

        if let Err(message) = outcome {
            error!(
                target = %label,
                visible = notification.visible,
                message = %message,
                "visibility callback panicked"
            );
            if let Some(sink) = &self.evidence
                && let Err(err) =
                    sink.write_failure(notification.batch, &label, notification.visible, &message)
            {
                warn!(error = %err, "failed to write visibility evidence");
            }
            report.failures.push(CallbackFailure {
                target: notification.target.clone(),
                visible: notification.visible,
                message,
            });
        }

        if notification.once && self.is_current(notification) {
            self.remove_element(&notification.target);
            report.released += 1;
        }
    }
}
