//! Error types for byte decoding in bleplex-types.

use thiserror::Error;

/// Errors that can occur when decoding attribute values.
///
/// This error type is platform-agnostic and does not include
/// transport or session errors (those belong in bleplex-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer is shorter than the requested fixed-width value.
    #[error("Insufficient data: requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Number of bytes the conversion needs.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// The bytes are present but do not form a valid value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ParseError {
    /// Create an insufficient-bytes error.
    pub fn insufficient(expected: usize, actual: usize) -> Self {
        Self::InsufficientBytes { expected, actual }
    }
}

/// Result type alias using bleplex-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
