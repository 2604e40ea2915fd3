use thiserror::Error;

/// Errors returned by [`crate::PageDirectory`] and [`crate::TranslationCache`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The page manager (and the LRU purge of cold leaf tables) could not satisfy a
    /// backing-page or page-table allocation.
    #[error("out of memory")]
    OutOfMemory,
    /// `vaddr` falls outside `[VM_ADDR_MIN, VM_ADDR_MAX]`.
    #[error("address {vaddr:#x} out of range")]
    OutOfRange {
        /// The offending guest virtual address.
        vaddr: u64,
    },
    /// The access width exceeds the alignment of `vaddr`.
    #[error("unaligned {width}-byte access at {vaddr:#x}")]
    Misaligned {
        /// The offending guest virtual address.
        vaddr: u64,
        /// The access width in bytes (1, 2, 4, or 8).
        width: u8,
    },
    /// Virtual frame number 0 (any address below `VM_ADDR_MIN`) was requested; VFN 0 is
    /// reserved so that a zero PTE unambiguously means "unmapped".
    #[error("virtual frame number 0 is reserved")]
    InvalidArgument {
        /// The offending guest virtual address.
        vaddr: u64,
    },
}
