#![forbid(unsafe_code)]

//! Host observation capability.
//!
//! The registry never computes intersections. It asks an [`ObservationHost`]
//! for one [`ObservationContext`] per distinct [`ContextKey`] and tells each
//! context which elements to watch. The host later delivers batches of
//! [`IntersectionEntry`] values through the registry's dispatcher, at times
//! and granularity the registry does not control.

use std::fmt;
use std::hash::Hash;

use crate::key::ContextKey;

/// One intersection record reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionEntry<E> {
    pub target: E,
    pub is_intersecting: bool,
    /// Visible fraction of the target, in `[0.0, 1.0]`.
    pub intersection_ratio: f64,
    /// Host timestamp of the observation, in milliseconds.
    pub time: f64,
}

impl<E> IntersectionEntry<E> {
    /// Entry for a target that is fully in view (`true`) or fully out of
    /// view (`false`), at time zero.
    #[must_use]
    pub fn new(target: E, is_intersecting: bool) -> Self {
        Self {
            target,
            is_intersecting,
            intersection_ratio: if is_intersecting { 1.0 } else { 0.0 },
            time: 0.0,
        }
    }

    #[must_use]
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.intersection_ratio = ratio;
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }
}

/// Errors raised by a host capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The host rejected the (frame, margin, threshold) configuration.
    InvalidConfig(String),
    /// The host could not watch the element or create the context.
    Unavailable(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid observation config: {msg}"),
            Self::Unavailable(msg) => write!(f, "observation unavailable: {msg}"),
        }
    }
}

impl std::error::Error for HostError {}

/// One configured observation context (a native observer instance).
pub trait ObservationContext<E> {
    /// Start reporting entries for `target`.
    fn watch(&mut self, target: &E) -> Result<(), HostError>;

    /// Stop reporting entries for `target`. Unknown targets are ignored.
    fn unwatch(&mut self, target: &E);

    /// Release the native resources behind this context. Called once, when
    /// the registry drops an idle context.
    fn disconnect(&mut self) {}
}

/// Factory for observation contexts.
///
/// A host is built around a single dispatch target (a
/// [`BatchDispatcher`](crate::BatchDispatcher) when used with
/// [`SharedRegistry`](crate::SharedRegistry)) and routes entries from every
/// context it creates to it.
pub trait ObservationHost {
    /// Element handle the host can watch.
    type Element: Clone + Eq + Hash + fmt::Debug + 'static;
    /// Reference frame handle. Equality must reflect frame identity.
    type Frame: Clone + Eq + Hash + fmt::Debug + 'static;
    type Context: ObservationContext<Self::Element>;

    /// Create a context for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidConfig`] when the host rejects the
    /// configuration.
    fn create_context(&mut self, key: &ContextKey<Self::Frame>)
    -> Result<Self::Context, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_uses_full_or_empty_ratio() {
        assert_eq!(IntersectionEntry::new(1, true).intersection_ratio, 1.0);
        assert_eq!(IntersectionEntry::new(1, false).intersection_ratio, 0.0);
    }

    #[test]
    fn entry_builders_override_detail() {
        let entry = IntersectionEntry::new("a", true)
            .with_ratio(0.25)
            .with_time(16.0);
        assert_eq!(entry.intersection_ratio, 0.25);
        assert_eq!(entry.time, 16.0);
        assert!(entry.is_intersecting);
    }

    #[test]
    fn host_error_display() {
        let err = HostError::InvalidConfig("threshold 2.0 out of range".into());
        assert_eq!(
            err.to_string(),
            "invalid observation config: threshold 2.0 out of range"
        );
        assert!(
            HostError::Unavailable("detached".into())
                .to_string()
                .contains("detached")
        );
    }
}
