#![forbid(unsafe_code)]

//! Ordered record of visibility callback invocations.

use std::cell::RefCell;
use std::rc::Rc;

use crate::recording_host::ElementId;

/// Shared, append-only log of `(element, visible)` calls.
///
/// Clones share the same log, so a test can hand callbacks to the registry
/// and keep a handle for assertions.
#[derive(Debug, Clone, Default)]
pub struct CallbackLog {
    calls: Rc<RefCell<Vec<(ElementId, bool)>>>,
}

impl CallbackLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback that records its invocations under `element`.
    #[must_use]
    pub fn callback(&self, element: ElementId) -> impl Fn(bool) + use<> {
        let calls = Rc::clone(&self.calls);
        move |visible| calls.borrow_mut().push((element, visible))
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(ElementId, bool)> {
        self.calls.borrow().clone()
    }

    /// Calls recorded for `element`, in order.
    #[must_use]
    pub fn calls_for(&self, element: ElementId) -> Vec<bool> {
        self.calls
            .borrow()
            .iter()
            .filter(|(target, _)| *target == element)
            .map(|(_, visible)| *visible)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.borrow().is_empty()
    }

    /// Drop everything recorded so far and return it.
    pub fn take(&self) -> Vec<(ElementId, bool)> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }
}
