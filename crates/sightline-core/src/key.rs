#![forbid(unsafe_code)]

//! Observation options and the context keys derived from them.
//!
//! A [`ContextKey`] is the (frame, margin, threshold) triple that decides
//! which underlying observation context watches an element. Two registrations
//! whose keys compare equal share a single context.
//!
//! # Equality policy
//!
//! - **Frame**: compared with the host frame type's own `Eq`/`Hash`. Hosts
//!   give frames identity semantics (see `sightline_web::DomNode`).
//! - **Margin**: compared by string value, without normalization. `"0px"` and
//!   `"0px 0px"` are different keys.
//! - **Threshold**: compared structurally. A scalar compares by value, a list
//!   element-wise. `0.0` and `-0.0` are the same ratio. A scalar and a
//!   one-element list are different keys.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Margin applied to the reference frame's bounds before intersection is
/// computed, in the host's syntax (CSS-like, e.g. `"10px 0px"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootMargin(String);

impl RootMargin {
    /// Create a margin from its textual form.
    #[must_use]
    pub fn new(margin: impl Into<String>) -> Self {
        Self(margin.into())
    }

    /// The margin as passed to the host.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RootMargin {
    fn default() -> Self {
        Self::new("0px")
    }
}

impl fmt::Display for RootMargin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RootMargin {
    fn from(margin: &str) -> Self {
        Self::new(margin)
    }
}

impl From<String> for RootMargin {
    fn from(margin: String) -> Self {
        Self(margin)
    }
}

/// Intersection-ratio breakpoints at which the host reports a transition.
#[derive(Debug, Clone)]
pub enum Threshold {
    /// A single breakpoint.
    Ratio(f64),
    /// Several breakpoints, in the order given.
    Steps(Vec<f64>),
}

impl Threshold {
    /// Breakpoints as a slice, regardless of shape.
    #[must_use]
    pub fn ratios(&self) -> &[f64] {
        match self {
            Self::Ratio(ratio) => std::slice::from_ref(ratio),
            Self::Steps(steps) => steps,
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::Ratio(0.0)
    }
}

/// Bit pattern used for equality and hashing: folds `-0.0` into `0.0` and
/// every NaN into one canonical NaN.
fn canonical_bits(ratio: f64) -> u64 {
    if ratio == 0.0 {
        0
    } else if ratio.is_nan() {
        f64::NAN.to_bits()
    } else {
        ratio.to_bits()
    }
}

impl PartialEq for Threshold {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ratio(a), Self::Ratio(b)) => canonical_bits(*a) == canonical_bits(*b),
            (Self::Steps(a), Self::Steps(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|(x, y)| canonical_bits(*x) == canonical_bits(*y))
            }
            _ => false,
        }
    }
}

impl Eq for Threshold {}

impl Hash for Threshold {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Ratio(ratio) => {
                0u8.hash(state);
                canonical_bits(*ratio).hash(state);
            }
            Self::Steps(steps) => {
                1u8.hash(state);
                steps.len().hash(state);
                for step in steps {
                    canonical_bits(*step).hash(state);
                }
            }
        }
    }
}

impl From<f64> for Threshold {
    fn from(ratio: f64) -> Self {
        Self::Ratio(ratio)
    }
}

impl From<Vec<f64>> for Threshold {
    fn from(steps: Vec<f64>) -> Self {
        Self::Steps(steps)
    }
}

impl From<&[f64]> for Threshold {
    fn from(steps: &[f64]) -> Self {
        Self::Steps(steps.to_vec())
    }
}

/// Identity of one observation context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey<F> {
    /// Reference frame; `None` is the top-level viewport.
    pub frame: Option<F>,
    pub margin: RootMargin,
    pub threshold: Threshold,
}

impl<F> Default for ContextKey<F> {
    fn default() -> Self {
        Self {
            frame: None,
            margin: RootMargin::default(),
            threshold: Threshold::default(),
        }
    }
}

/// Per-registration options.
///
/// Every builder call starts from [`ObserveOptions::default`], so fields
/// that are not set keep the default rather than any earlier registration's
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveOptions<F> {
    pub frame: Option<F>,
    pub margin: RootMargin,
    pub threshold: Threshold,
    /// Unregister automatically after the first visibility transition.
    pub once: bool,
}

impl<F> Default for ObserveOptions<F> {
    fn default() -> Self {
        Self {
            frame: None,
            margin: RootMargin::default(),
            threshold: Threshold::default(),
            once: false,
        }
    }
}

impl<F> ObserveOptions<F> {
    /// Default options: top-level viewport, `"0px"` margin, `0.0` threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_frame(mut self, frame: F) -> Self {
        self.frame = Some(frame);
        self
    }

    #[must_use]
    pub fn with_margin(mut self, margin: impl Into<RootMargin>) -> Self {
        self.margin = margin.into();
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: impl Into<Threshold>) -> Self {
        self.threshold = threshold.into();
        self
    }

    /// Mark the registration as one-shot.
    #[must_use]
    pub fn once(self) -> Self {
        self.with_once(true)
    }

    #[must_use]
    pub fn with_once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    /// Split into the context key and the one-shot flag.
    #[must_use]
    pub fn into_parts(self) -> (ContextKey<F>, bool) {
        let key = ContextKey {
            frame: self.frame,
            margin: self.margin,
            threshold: self.threshold,
        };
        (key, self.once)
    }
}

impl<F: Clone> ObserveOptions<F> {
    /// Context key for these options.
    #[must_use]
    pub fn key(&self) -> ContextKey<F> {
        ContextKey {
            frame: self.frame.clone(),
            margin: self.margin.clone(),
            threshold: self.threshold.clone(),
        }
    }
}
