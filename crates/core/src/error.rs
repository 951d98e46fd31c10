//! Shared error model.

use thiserror::Error;

/// Error raised by the shared building blocks.
///
/// Keep this focused on deterministic input failures (bad ids, unknown
/// topic names, malformed envelopes). Infrastructure concerns belong to the
/// infra crate's own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
