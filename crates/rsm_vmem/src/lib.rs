//! Guest virtual memory atop [`rsm_pagemgr::PageManager`].
//!
//! [`PageDirectory`] is a lazily-populated, multi-level guest page table backed by a page
//! manager; [`TranslationCache`] is a small direct-mapped software TLB that sits in front
//! of it so repeated accesses to the same guest page skip the directory walk.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]

mod cache;
mod error;
mod pagedir;
mod pte;

pub use cache::{CACHE_ENTRIES, GuestInt, TranslationCache};
pub use error::VmError;
pub use pagedir::{PageDirectory, vm_addr_max, vm_addr_min};
