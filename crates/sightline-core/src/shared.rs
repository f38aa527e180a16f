#![forbid(unsafe_code)]

//! Host-driven shared registry.
//!
//! Native observation primitives take their notification callback at
//! construction time, while the registry owns the host that creates them.
//! [`SharedRegistry::new`] breaks the cycle: it hands the host factory a
//! [`BatchDispatcher`], a weak handle that every context the host creates
//! uses as its single delivery entry point.
//!
//! # Re-entrancy
//!
//! Callbacks run with the registry borrow released, so a callback may add or
//! remove elements through the [`SharedRegistry`]. Batches delivered while a
//! batch is being dispatched are queued and processed after it, so every
//! batch is applied atomically.
//!
//! # Failure Modes
//!
//! - **Delivery after drop**: the dispatcher holds a `Weak`; delivering to a
//!   dropped registry is a silent no-op.
//! - **Strong handles in callbacks**: a callback that captures a
//!   [`SharedRegistry`] clone keeps the registry alive through its own
//!   registrant and leaks it. Capture a [`WeakRegistry`] from
//!   [`SharedRegistry::downgrade`] instead.
//! - **Delivery during a borrow**: a host that delivers synchronously from
//!   inside `watch` finds the registry borrowed. The batch stays queued and is
//!   drained when the registering call returns.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::evidence_sink::EvidenceSink;
use crate::host::{IntersectionEntry, ObservationHost};
use crate::key::ObserveOptions;
use crate::registry::{DispatchReport, VisibilityRegistry, invoke_isolated};

type Batch<E> = Vec<IntersectionEntry<E>>;

/// Running totals across every batch a shared registry has dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches: u64,
    pub notified: u64,
    pub released: u64,
    pub failures: u64,
}

impl DispatchStats {
    fn absorb<E>(&mut self, report: &DispatchReport<E>) {
        self.batches += 1;
        self.notified += report.notified as u64;
        self.released += report.released as u64;
        self.failures += report.failures.len() as u64;
    }
}

struct SharedInner<H: ObservationHost> {
    registry: RefCell<VisibilityRegistry<H>>,
    pending: RefCell<VecDeque<Batch<H::Element>>>,
    dispatching: Cell<bool>,
    stats: Cell<DispatchStats>,
}

impl<H: ObservationHost> SharedInner<H> {
    fn new(registry: VisibilityRegistry<H>) -> Self {
        Self {
            registry: RefCell::new(registry),
            pending: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
            stats: Cell::new(DispatchStats::default()),
        }
    }

    /// Process queued batches until the queue is empty or the registry is
    /// borrowed elsewhere.
    fn drain(&self) {
        if self.dispatching.replace(true) {
            return;
        }
        loop {
            let Ok(mut registry) = self.registry.try_borrow_mut() else {
                trace!("registry busy; batch stays queued");
                break;
            };
            let Some(batch) = self.pending.borrow_mut().pop_front() else {
                break;
            };
            let notifications = registry.apply_batch(batch);
            drop(registry);

            let mut report = DispatchReport::default();
            for notification in notifications {
                let current = self.registry.borrow().is_current(&notification);
                if !current {
                    continue;
                }
                let outcome = invoke_isolated(&notification.callback, notification.visible);
                self.registry
                    .borrow_mut()
                    .settle(&notification, outcome, &mut report);
            }

            let mut stats = self.stats.get();
            stats.absorb(&report);
            self.stats.set(stats);
        }
        self.dispatching.set(false);
    }
}

/// Delivery entry point handed to the host.
///
/// Cheap to clone; every clone targets the same registry.
pub struct BatchDispatcher<H: ObservationHost> {
    inner: Weak<SharedInner<H>>,
}

impl<H: ObservationHost> Clone for BatchDispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<H: ObservationHost> std::fmt::Debug for BatchDispatcher<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<H: ObservationHost> BatchDispatcher<H> {
    /// Queue a batch and dispatch it unless a dispatch is already running.
    pub fn deliver<I>(&self, entries: I)
    where
        I: IntoIterator<Item = IntersectionEntry<H::Element>>,
    {
        let Some(inner) = self.inner.upgrade() else {
            trace!("registry dropped; discarding batch");
            return;
        };
        inner.pending.borrow_mut().push_back(entries.into_iter().collect());
        inner.drain();
    }

    /// True while the target registry is alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

/// Weak counterpart of [`SharedRegistry`].
pub struct WeakRegistry<H: ObservationHost> {
    inner: Weak<SharedInner<H>>,
}

impl<H: ObservationHost> Clone for WeakRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<H: ObservationHost> std::fmt::Debug for WeakRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRegistry")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<H: ObservationHost> WeakRegistry<H> {
    /// The registry, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<SharedRegistry<H>> {
        self.inner.upgrade().map(|inner| SharedRegistry { inner })
    }
}

/// Reference-counted registry whose host delivers through a
/// [`BatchDispatcher`].
///
/// Cloning shares the same registry.
pub struct SharedRegistry<H: ObservationHost> {
    inner: Rc<SharedInner<H>>,
}

impl<H: ObservationHost> Clone for SharedRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<H: ObservationHost> std::fmt::Debug for SharedRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("stats", &self.inner.stats.get())
            .field("pending", &self.inner.pending.borrow().len())
            .finish_non_exhaustive()
    }
}

impl<H: ObservationHost> SharedRegistry<H> {
    /// Build a registry with the default configuration around the host
    /// returned by `make_host`.
    #[must_use]
    pub fn new(make_host: impl FnOnce(BatchDispatcher<H>) -> H) -> Self {
        Self::from_parts(make_host, RegistryConfig::default(), None)
    }

    /// Like [`new`](Self::new) with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Evidence`] if the evidence sink cannot be
    /// opened.
    pub fn with_config(
        make_host: impl FnOnce(BatchDispatcher<H>) -> H,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        let evidence = EvidenceSink::from_config(&config.evidence)?;
        Ok(Self::from_parts(make_host, config, evidence))
    }

    fn from_parts(
        make_host: impl FnOnce(BatchDispatcher<H>) -> H,
        config: RegistryConfig,
        evidence: Option<EvidenceSink>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<SharedInner<H>>| {
            let dispatcher = BatchDispatcher {
                inner: Weak::clone(weak),
            };
            let host = make_host(dispatcher);
            SharedInner::new(VisibilityRegistry::from_parts(host, config, evidence))
        });
        Self { inner }
    }

    /// Non-owning handle, for callbacks that need to reach the registry.
    #[must_use]
    pub fn downgrade(&self) -> WeakRegistry<H> {
        WeakRegistry {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// A new dispatcher for this registry.
    #[must_use]
    pub fn dispatcher(&self) -> BatchDispatcher<H> {
        BatchDispatcher {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Deliver a batch as if it came from the host.
    pub fn deliver<I>(&self, entries: I)
    where
        I: IntoIterator<Item = IntersectionEntry<H::Element>>,
    {
        self.dispatcher().deliver(entries);
    }

    /// Totals across all dispatched batches.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.inner.stats.get()
    }

    /// Batches waiting for the registry to become free.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Borrow the registry.
    ///
    /// # Panics
    ///
    /// Panics if the registry is mutably borrowed.
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, VisibilityRegistry<H>> {
        self.inner.registry.borrow()
    }

    /// Mutably borrow the registry. Batches queued while the guard is held
    /// are dispatched by the next call that goes through `SharedRegistry`.
    ///
    /// # Panics
    ///
    /// Panics if the registry is already borrowed.
    #[must_use]
    pub fn borrow_mut(&self) -> RefMut<'_, VisibilityRegistry<H>> {
        self.inner.registry.borrow_mut()
    }

    /// Run `f` on the registry, then dispatch any batches it queued.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut VisibilityRegistry<H>) -> R) -> R {
        let result = f(&mut self.inner.registry.borrow_mut());
        self.inner.drain();
        result
    }

    /// See [`VisibilityRegistry::add_element`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] on host rejection.
    pub fn add_element(
        &self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
    ) -> Result<&Self, RegistryError> {
        self.add_element_with(element, callback, ObserveOptions::default())
    }

    /// See [`VisibilityRegistry::add_element_with`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] on host rejection.
    pub fn add_element_with(
        &self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&Self, RegistryError> {
        self.with_mut(|registry| {
            registry
                .add_element_with(element, callback, options)
                .map(|_| ())
        })?;
        Ok(self)
    }

    /// See [`VisibilityRegistry::add_elements`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] on host rejection.
    pub fn add_elements<I>(
        &self,
        elements: I,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&Self, RegistryError>
    where
        I: IntoIterator<Item = H::Element>,
    {
        self.with_mut(|registry| {
            registry
                .add_elements(elements, callback, options)
                .map(|_| ())
        })?;
        Ok(self)
    }

    /// See [`VisibilityRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] for duplicates or
    /// [`RegistryError::Host`] on host rejection.
    pub fn register(
        &self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&Self, RegistryError> {
        self.with_mut(|registry| registry.register(element, callback, options).map(|_| ()))?;
        Ok(self)
    }

    /// See [`VisibilityRegistry::replace_element`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Host`] on host rejection.
    pub fn replace_element(
        &self,
        element: H::Element,
        callback: impl Fn(bool) + 'static,
        options: ObserveOptions<H::Frame>,
    ) -> Result<&Self, RegistryError> {
        self.with_mut(|registry| {
            registry
                .replace_element(element, callback, options)
                .map(|_| ())
        })?;
        Ok(self)
    }

    /// See [`VisibilityRegistry::remove_element`].
    pub fn remove_element(&self, element: &H::Element) -> bool {
        self.with_mut(|registry| registry.remove_element(element))
    }

    #[must_use]
    pub fn contains(&self, element: &H::Element) -> bool {
        self.borrow().contains(element)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.borrow().is_empty()
    }

    #[must_use]
    pub fn visibility(&self, element: &H::Element) -> Option<bool> {
        self.borrow().visibility(element)
    }
}
