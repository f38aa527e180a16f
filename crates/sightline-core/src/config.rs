#![forbid(unsafe_code)]

//! Registry configuration.
//!
//! Configuration is plain data with builder methods. [`RegistryConfig::from_env`]
//! reads overrides from the process environment:
//!
//! | Variable | Effect |
//! |---|---|
//! | `SIGHTLINE_RETAIN_CONTEXTS` | Truthy (`1`, `true`, `yes`, `on`) keeps idle contexts alive. |
//! | `SIGHTLINE_EVIDENCE_LOG` | `stdout` or a file path enables the JSONL evidence log. |

use crate::evidence_sink::EvidenceSinkConfig;

/// What happens to a context once it watches no elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextRetention {
    /// Disconnect and drop it; it is recreated lazily on next use.
    #[default]
    Release,
    /// Keep it for the lifetime of the registry.
    Retain,
}

/// Configuration for a [`VisibilityRegistry`](crate::VisibilityRegistry).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    pub retention: ContextRetention,
    pub evidence: EvidenceSinkConfig,
}

const RETAIN_CONTEXTS_VAR: &str = "SIGHTLINE_RETAIN_CONTEXTS";
const EVIDENCE_LOG_VAR: &str = "SIGHTLINE_EVIDENCE_LOG";

#[inline]
fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl RegistryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retention(mut self, retention: ContextRetention) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: EvidenceSinkConfig) -> Self {
        self.evidence = evidence;
        self
    }

    /// Defaults with overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides from a custom environment lookup.
    #[must_use]
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if get_env(RETAIN_CONTEXTS_VAR).is_some_and(|value| env_flag(&value)) {
            config.retention = ContextRetention::Retain;
        }
        if let Some(target) = get_env(EVIDENCE_LOG_VAR) {
            let target = target.trim();
            if target.eq_ignore_ascii_case("stdout") {
                config.evidence = EvidenceSinkConfig::enabled_stdout();
            } else if !target.is_empty() {
                config.evidence = EvidenceSinkConfig::enabled_file(target);
            }
        }
        config
    }
}
