//! Error types for revision handling.

use thiserror::Error;

/// Result type for revision operations.
pub type RevisionResult<T> = Result<T, RevisionError>;

/// Errors that can occur while parsing or encoding revisions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevisionError {
    /// The revision ID is not of the form `<generation>-<suffix>`.
    #[error("malformed revision ID: {0:?}")]
    Malformed(String),

    /// The history does not descend one generation at a time.
    #[error("revision history is not contiguous at index {index}")]
    NotContiguous {
        /// Position of the first out-of-sequence entry.
        index: usize,
    },

    /// Compact history would need a generation below 1.
    #[error("compact history start {start} is too small for {len} IDs")]
    StartTooSmall {
        /// Declared start generation.
        start: u64,
        /// Number of suffixes.
        len: usize,
    },

    /// An empty history cannot be encoded.
    #[error("revision history is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RevisionError::Malformed("abc".into());
        assert_eq!(err.to_string(), "malformed revision ID: \"abc\"");

        let err = RevisionError::NotContiguous { index: 3 };
        assert!(err.to_string().contains('3'));
    }
}
