//! # Error Taxonomy
//!
//! Domain errors for the resolution core. Structural and integrity violations
//! are errors; the absence of a rule match is the normal "new identity"
//! outcome and never surfaces here.

use crate::assertion::AssertionError;
use thiserror::Error;

/// Top-level error for resolution operations.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Malformed rule or attribute definitions. Fatal at load time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A manual-override batch failed validation and was aborted.
    #[error(transparent)]
    Assertion(#[from] AssertionError),

    /// Storage read/write failure surfaced from a persistence collaborator.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl ResolveError {
    /// Shorthand for configuration failures.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
