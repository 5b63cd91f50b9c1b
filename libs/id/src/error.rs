//! Errors raised while parsing workload ids.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,

    #[error("id prefix mismatch: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `-` between prefix and ULID.
    #[error("id missing '-' separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// Uppercase input is rejected so that one id has exactly one spelling.
    #[error("id must be lowercase: {0}")]
    NotLowercase(String),
}

impl IdError {
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. } | IdError::MissingSeparator)
    }
}
