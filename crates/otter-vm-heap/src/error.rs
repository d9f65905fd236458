//! Heap error types

use thiserror::Error;

/// Errors surfaced by heap operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// Allocation failed even after mark-and-sweep retries
    #[error("OutOfMemory")]
    OutOfMemory,

    /// A property table would exceed the maximum property count
    #[error("OutOfMemory: property count limit exceeded ({requested})")]
    PropertyLimit {
        /// Requested part size
        requested: u64,
    },

    /// Range error (e.g. array length overflow)
    #[error("RangeError: {0}")]
    RangeError(String),

    /// Type error (e.g. wrong heap type for an operation)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Handle does not refer to a live heap cell
    #[error("invalid heap reference")]
    InvalidRef,

    /// Internal consistency violation
    #[error("InternalError: {0}")]
    Internal(String),
}

impl HeapError {
    /// Create a range error
    pub fn range_error(msg: impl Into<String>) -> Self {
        HeapError::RangeError(msg.into())
    }

    /// Create a type error
    pub fn type_error(msg: impl Into<String>) -> Self {
        HeapError::TypeError(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        HeapError::Internal(msg.into())
    }

    /// True for errors in the allocation-failure class
    pub fn is_alloc_failure(&self) -> bool {
        matches!(self, HeapError::OutOfMemory | HeapError::PropertyLimit { .. })
    }
}

/// Result alias for heap operations
pub type HeapResult<T> = std::result::Result<T, HeapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_failure_class() {
        assert!(HeapError::OutOfMemory.is_alloc_failure());
        assert!(HeapError::PropertyLimit { requested: 1 << 31 }.is_alloc_failure());
        assert!(!HeapError::range_error("x").is_alloc_failure());
    }

    #[test]
    fn test_messages() {
        assert_eq!(HeapError::range_error("bad length").to_string(), "RangeError: bad length");
        assert_eq!(HeapError::OutOfMemory.to_string(), "OutOfMemory");
    }
}
