//! Error types for stream buffer operations.
//!
//! Only programmer mistakes and lifetime violations are errors. Timeouts,
//! cancellation, a dead device and partial copies are ordinary return values.

/// Result type alias for streambuf.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Error type for streambuf operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// An offset or length lies outside the valid range.
    #[error("{what} out of range: {value} (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: usize,
        limit: usize,
    },

    /// Capacity must be at least one element.
    #[error("capacity must be greater than 0")]
    InvalidCapacity,

    /// Timeout below the infinite sentinel (-1).
    #[error("invalid timeout: {0}ms")]
    InvalidTimeout(i32),

    /// The buffer has been closed and can no longer be used.
    #[error("buffer: closed")]
    Closed,

    /// The background wait task failed before producing a result.
    #[error("wait aborted: {0}")]
    WaitAborted(String),
}

impl BufferError {
    pub(crate) fn out_of_range(what: &'static str, value: usize, limit: usize) -> Self {
        BufferError::OutOfRange { what, value, limit }
    }
}
