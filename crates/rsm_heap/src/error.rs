use thiserror::Error;

/// Errors returned by [`crate::HeapAllocator`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Neither the slab heaps nor the subheaps could satisfy the request, and growing the
    /// heap by requesting more pages from the page manager also failed.
    #[error("out of memory")]
    OutOfMemory,
    /// `alignment` was not a power of two, or exceeded the page size.
    #[error("invalid alignment: {alignment}")]
    InvalidArgument { alignment: usize },
    /// `free` was called with a pointer/size that does not correspond to any outstanding
    /// allocation tracked by this heap.
    #[error("region does not belong to this heap")]
    InvalidRegion,
}
