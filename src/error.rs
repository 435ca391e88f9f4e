//! Error taxonomy shared by every container in the crate.

use thiserror::Error;

/// Failures surfaced by container operations.
///
/// Contract violations (`OutOfBounds`, `InvalidatedPosition`, `EmptyPosition`,
/// `PositionOccupied`, `Unsupported`) are only reported when the `checked`
/// feature is enabled; otherwise they are debug assertions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Index past the end of an array.
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds {
        /// The rejected index.
        index: usize,
        /// Length at the time of the call.
        len: usize,
    },

    /// A position was created before the latest structural mutation.
    #[error("position was invalidated by a structural mutation")]
    InvalidatedPosition,

    /// A position that does not refer to an item was dereferenced.
    #[error("position does not refer to an item")]
    EmptyPosition,

    /// `add` was called with a position that refers to an existing item.
    #[error("position already refers to an item")]
    PositionOccupied,

    /// The container's traits do not provide the required capability.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The allocator returned null.
    #[error("memory allocation failed: requested {size} bytes")]
    OutOfMemory {
        /// Requested allocation size in bytes.
        size: usize,
    },

    /// A bucket cluster has no free slot in its largest size class.
    #[error("bucket is full")]
    BucketFull,
}

impl Error {
    pub(crate) fn out_of_bounds(index: usize, len: usize) -> Self {
        Self::OutOfBounds { index, len }
    }

    pub(crate) fn out_of_memory(size: usize) -> Self {
        Self::OutOfMemory { size }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory { size: usize::MAX }
    }
}

/// Crate result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;
