//! Common error types.
//!
//! Transient peer failures never reach this level; they are absorbed by the
//! peer pool (shutdown + blacklist + requeue). What does surface here is
//! everything the user can act on: bad input, an unreachable initial server,
//! a broken fixture file.

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::deriver::DeriverError;

/// Root error type
#[derive(Debug, Error)]
pub enum BeancounterError {
    /// Configuration / user-input errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address derivation errors
    #[error("derivation error: {0}")]
    Deriver(#[from] DeriverError),

    /// Backend startup / readiness errors
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Usage errors (bad flags, missing arguments)
    #[error("usage error: {0}")]
    Usage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeancounterError {
    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}

/// Result type alias using BeancounterError
pub type Result<T> = std::result::Result<T, BeancounterError>;
