#![forbid(unsafe_code)]

//! Native form of the `IntersectionObserverInit` dictionary.
//!
//! Building and checking the init is plain Rust so it can be unit tested off
//! the browser; the wasm module only copies the result into a JS object.

use sightline_core::{ContextKey, HostError};

/// Options for one `IntersectionObserver`, derived from a [`ContextKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverInit {
    pub root_margin: String,
    pub thresholds: Vec<f64>,
    /// `false` observes against the top-level viewport.
    pub has_root: bool,
}

impl ObserverInit {
    #[must_use]
    pub fn from_key<F>(key: &ContextKey<F>) -> Self {
        Self {
            root_margin: key.margin.as_str().to_string(),
            thresholds: key.threshold.ratios().to_vec(),
            has_root: key.frame.is_some(),
        }
    }

    /// Reject values the browser would throw on, with a readable message.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidConfig`] for a malformed margin or a
    /// threshold outside `[0, 1]`.
    pub fn check(&self) -> Result<(), HostError> {
        check_margin(&self.root_margin)?;
        if self.thresholds.is_empty() {
            return Err(HostError::InvalidConfig("threshold list is empty".into()));
        }
        for &ratio in &self.thresholds {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(HostError::InvalidConfig(format!(
                    "threshold {ratio} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// One to four whitespace-separated lengths, each in `px` or `%`.
fn check_margin(margin: &str) -> Result<(), HostError> {
    let parts: Vec<&str> = margin.split_whitespace().collect();
    if parts.is_empty() || parts.len() > 4 {
        return Err(HostError::InvalidConfig(format!(
            "rootMargin {margin:?} must have one to four lengths"
        )));
    }
    for part in parts {
        let number = part
            .strip_suffix("px")
            .or_else(|| part.strip_suffix('%'))
            .ok_or_else(|| {
                HostError::InvalidConfig(format!(
                    "rootMargin length {part:?} must be in px or %"
                ))
            })?;
        if !number.parse::<f64>().is_ok_and(f64::is_finite) {
            return Err(HostError::InvalidConfig(format!(
                "rootMargin length {part:?} is not a number"
            )));
        }
    }
    Ok(())
}
