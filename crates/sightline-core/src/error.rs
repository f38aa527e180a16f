#![forbid(unsafe_code)]

//! Registry error type.

use std::fmt;
use std::io;

use crate::host::HostError;

/// Errors returned by registration operations.
#[derive(Debug)]
pub enum RegistryError {
    /// The host rejected the configuration or the watch request.
    Host(HostError),
    /// Strict registration of an element that is already registered.
    AlreadyRegistered {
        /// `Debug` rendering of the element.
        target: String,
    },
    /// The evidence sink could not be opened.
    Evidence(io::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(err) => write!(f, "host error: {err}"),
            Self::AlreadyRegistered { target } => {
                write!(f, "element already registered: {target}")
            }
            Self::Evidence(err) => write!(f, "evidence sink error: {err}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Host(err) => Some(err),
            Self::AlreadyRegistered { .. } => None,
            Self::Evidence(err) => Some(err),
        }
    }
}

impl From<HostError> for RegistryError {
    fn from(err: HostError) -> Self {
        Self::Host(err)
    }
}

impl From<io::Error> for RegistryError {
    fn from(err: io::Error) -> Self {
        Self::Evidence(err)
    }
}
