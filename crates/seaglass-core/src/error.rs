//! Error types for the core primitives.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A fixed-capacity region cannot satisfy a request.
    #[error("{name}: requested {requested} bytes but only {available} of {capacity} remain")]
    CapacityExceeded {
        name: String,
        requested: u64,
        available: u64,
        capacity: u64,
    },

    /// A free list or index pool has no entries left.
    #[error("Exhausted: {0}")]
    Exhausted(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A resource was released more times than it was acquired.
    #[error("Release of unreferenced resource: {0}")]
    ReleaseUnreferenced(String),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
