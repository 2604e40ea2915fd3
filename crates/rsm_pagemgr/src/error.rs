use thiserror::Error;

/// Errors returned by [`crate::PageManager`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PmError {
    /// The managed range cannot hold bitset metadata plus at least one usable page.
    #[error("host range too small to hold page manager metadata")]
    RangeTooSmall,
    /// `npages` was not a power of two, or exceeded the largest representable order.
    #[error("invalid page count: {npages}")]
    InvalidArgument { npages: usize },
    /// No free block of the requested (or any larger) order was available.
    #[error("out of memory")]
    OutOfMemory,
}
